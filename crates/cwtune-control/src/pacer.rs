//! Cancellable waits between experiment phases.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

/// The operator asked the experiment to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("experiment cancelled")]
pub struct Cancelled;

/// Requests a stop. Dropping it without calling [`Shutdown::trigger`] never
/// cancels anything.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Create a linked shutdown trigger and pacer.
pub fn channel(unit: Duration) -> (Shutdown, Pacer) {
    let (tx, rx) = watch::channel(false);
    (Shutdown { tx }, Pacer { unit, shutdown: rx })
}

/// Sleeps in whole time units, returning early on shutdown.
#[derive(Debug, Clone)]
pub struct Pacer {
    unit: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Pacer {
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Fail fast if a stop was requested.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Wait `units` time units. Waits too long to represent saturate.
    pub async fn wait(&mut self, units: u32) -> Result<(), Cancelled> {
        if *self.shutdown.borrow_and_update() {
            return Err(Cancelled);
        }

        let sleep = tokio::time::sleep(self.unit.saturating_mul(units));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        // Trigger dropped: nobody can cancel any more.
                        (&mut sleep).await;
                        return Ok(());
                    }
                    if *self.shutdown.borrow_and_update() {
                        return Err(Cancelled);
                    }
                }
            }
        }
    }

    /// Resolves once a stop is requested. Never resolves if the trigger is
    /// dropped untouched.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.shutdown.borrow_and_update() {
                return;
            }
            if self.shutdown.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn wait_sleeps_whole_units() {
        let (_shutdown, mut pacer) = channel(Duration::from_millis(10));
        let started = Instant::now();
        pacer.wait(3).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn trigger_interrupts_wait() {
        let (shutdown, mut pacer) = channel(Duration::from_secs(60));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            shutdown.trigger();
        });

        let started = Instant::now();
        assert_eq!(pacer.wait(30).await, Err(Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(pacer.is_cancelled());
    }

    #[tokio::test]
    async fn oversized_wait_saturates() {
        let (shutdown, mut pacer) = channel(Duration::MAX);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            shutdown.trigger();
        });

        assert_eq!(pacer.wait(u32::MAX).await, Err(Cancelled));
    }

    #[tokio::test]
    async fn cancelled_pacer_never_waits() {
        let (shutdown, mut pacer) = channel(Duration::from_secs(60));
        shutdown.trigger();

        assert_eq!(pacer.checkpoint(), Err(Cancelled));
        assert_eq!(pacer.wait(1).await, Err(Cancelled));
        pacer.cancelled().await;
    }

    #[tokio::test]
    async fn dropped_trigger_still_sleeps() {
        let (shutdown, mut pacer) = channel(Duration::from_millis(5));
        drop(shutdown);

        assert_eq!(pacer.wait(2).await, Ok(()));
        assert_eq!(pacer.checkpoint(), Ok(()));
    }

    #[tokio::test]
    async fn clones_share_the_trigger() {
        let (shutdown, pacer) = channel(Duration::from_millis(5));
        let mut other = pacer.clone();
        shutdown.trigger();
        assert!(pacer.is_cancelled());
        assert_eq!(other.wait(1).await, Err(Cancelled));
    }
}
