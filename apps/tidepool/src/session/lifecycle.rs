use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Created,
    Running,
    Closed,
}

/// Shared `Created -> Running -> Closed` marker. Every continuation that
/// resumes after an await checks it before touching shared state.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<LifecyclePhase>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecyclePhase::Created);
        Self { tx: Arc::new(tx) }
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.tx.borrow()
    }

    /// `Created -> Running`. False if the session already moved on.
    pub fn start(&self) -> bool {
        self.tx.send_if_modified(|phase| {
            if *phase == LifecyclePhase::Created {
                *phase = LifecyclePhase::Running;
                true
            } else {
                false
            }
        })
    }

    /// Any phase `-> Closed`. False if it was already closed.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|phase| {
            if *phase == LifecyclePhase::Closed {
                false
            } else {
                *phase = LifecyclePhase::Closed;
                true
            }
        })
    }

    pub fn is_running(&self) -> bool {
        self.phase() == LifecyclePhase::Running
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == LifecyclePhase::Closed
    }

    /// Resolves once the lifecycle reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|phase| *phase == LifecyclePhase::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn transitions_are_one_way() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.is_running());
        assert!(lifecycle.start());
        assert!(!lifecycle.start());
        assert!(lifecycle.is_running());
        assert!(lifecycle.close());
        assert!(!lifecycle.close());
        assert!(!lifecycle.start());
        assert_eq!(lifecycle.phase(), LifecyclePhase::Closed);
    }

    #[tokio::test]
    async fn closed_wakes_waiters() {
        let lifecycle = Lifecycle::new();
        lifecycle.start();
        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.closed().await })
        };
        lifecycle.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("joined");
    }
}
