//! Route map readiness, one signal per page-load epoch.

use tokio::sync::watch;

/// Returned by [`ReadinessToken::wait`] when the signal was re-armed before
/// it resolved. Take a fresh token and wait again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rearmed;

/// Owner side of the signal.
#[derive(Debug)]
pub struct Readiness {
    epoch: u64,
    tx: watch::Sender<bool>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { epoch: 1, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn token(&self) -> ReadinessToken {
        ReadinessToken {
            epoch: self.epoch,
            rx: self.tx.subscribe(),
        }
    }

    /// Resolve the current epoch. Only the first call per epoch returns `true`.
    pub fn resolve(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Start a new, unresolved epoch. Waiters on the old one get [`Rearmed`].
    pub fn rearm(&mut self) {
        let (tx, _) = watch::channel(false);
        self.tx = tx;
        self.epoch += 1;
    }
}

/// Waiter side of the signal.
#[derive(Debug, Clone)]
pub struct ReadinessToken {
    epoch: u64,
    rx: watch::Receiver<bool>,
}

impl ReadinessToken {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Wait until resolved. Returns immediately if it already is.
    pub async fn wait(&mut self) -> Result<(), Rearmed> {
        self.rx.wait_for(|ready| *ready).await.map(|_| ()).map_err(|_| Rearmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_after_resolve_returns_immediately() {
        let readiness = Readiness::new();
        assert!(readiness.resolve());
        assert!(!readiness.resolve());
        readiness.token().wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_before_resolve_blocks_until_resolved() {
        let readiness = Readiness::new();
        let mut token = readiness.token();
        let waiter = tokio::spawn(async move { token.wait().await });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        readiness.resolve();
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_rearm_starts_new_epoch() {
        let mut readiness = Readiness::new();
        readiness.resolve();
        let mut stale = readiness.token();

        readiness.rearm();
        assert_eq!(readiness.epoch(), 2);
        assert!(!readiness.is_ready());

        // An old token that had already resolved stays resolved.
        stale.wait().await.unwrap();

        let mut pending = readiness.token();
        let waiter = tokio::spawn(async move { pending.wait().await });
        tokio::task::yield_now().await;
        readiness.rearm();
        assert_eq!(waiter.await.unwrap(), Err(Rearmed));
    }
}
