//! # PageRoute Page
//!
//! The page side of route sync. A [`PageController`] declares the page's
//! routes to the worker, tracks when the route map is ready and funnels every
//! route change through one FIFO navigation queue.
//!
//! ```text
//!   declare_route ──► ADD_ROUTE* + STORE_MAP ──► worker
//!                                               │
//!   readiness ◄──────────── MAP_READY ◄─────────┘
//!       │
//!   navigate_to ──► queue ──► wait ready ──► fetch fragment ──► ContentSink
//! ```

pub mod controller;
pub mod history;
pub mod queue;
pub mod readiness;
pub mod render;

pub use controller::{ControllerConfig, ControllerError, LoadOutcome, PageController, SyncState};
pub use history::{HistoryEntry, NavigationType, SessionHistory};
pub use queue::NavigationQueue;
pub use readiness::{Readiness, ReadinessToken, Rearmed};
pub use render::{ContentSink, NoTransition, RecordingSink, Rendered, TimedTransition, TransitionDriver};
