//! What to do when a fleet command fails.

use std::future::Future;

use cwtune_fleet::Outcome;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Error;
use crate::pacer::Pacer;
use crate::phase::Halt;

/// Failure policy for fleet commands.
///
/// Commands are always logged. `BestEffort` moves on regardless, `Retry`
/// re-sends a failed command before moving on, and `Escalate` stops the run
/// once too many commands in a row have failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    BestEffort,
    Retry {
        attempts: u32,
    },
    Escalate {
        max_consecutive_failures: u32,
    },
}

/// Applies a [`FailurePolicy`] to a stream of fleet commands.
#[derive(Debug)]
pub struct FailureTracker {
    policy: FailurePolicy,
    consecutive: u32,
    total: u64,
}

impl FailureTracker {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            consecutive: 0,
            total: 0,
        }
    }

    /// Failed commands since the tracker was created.
    pub fn total_failures(&self) -> u64 {
        self.total
    }

    /// Issue a command through the policy.
    ///
    /// `send` is called again for every retry, one pacer unit after the
    /// previous attempt. Nothing is sent once `pacer` is cancelled, including
    /// pending retries. Returns the last outcome, or `Error::Escalated` when
    /// the escalation threshold is reached.
    pub(crate) async fn issue<F, Fut>(
        &mut self,
        operation: &str,
        pacer: &mut Pacer,
        mut send: F,
    ) -> Result<Outcome, Halt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let retries = match self.policy {
            FailurePolicy::Retry { attempts } => attempts,
            _ => 0,
        };

        pacer.checkpoint()?;
        let mut outcome = send().await;
        let mut attempt = 0;
        while !outcome.is_success() && attempt < retries {
            attempt += 1;
            warn!(operation, attempt, %outcome, "fleet command failed, retrying");
            pacer.wait(1).await?;
            outcome = send().await;
        }

        if outcome.is_success() {
            self.consecutive = 0;
            debug!(operation, %outcome, "fleet command acknowledged");
            return Ok(outcome);
        }

        self.consecutive += 1;
        self.total += 1;
        warn!(
            operation,
            %outcome,
            consecutive = self.consecutive,
            "fleet command failed, continuing"
        );

        if let FailurePolicy::Escalate {
            max_consecutive_failures,
        } = self.policy
        {
            if self.consecutive >= max_consecutive_failures {
                return Err(Halt::Failed(Error::Escalated {
                    operation: operation.to_string(),
                    failures: self.consecutive,
                }));
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacer;
    use std::cell::Cell;
    use std::time::Duration;

    fn failing() -> Outcome {
        Outcome::failed("agent", 3, "busy")
    }

    #[tokio::test]
    async fn best_effort_continues() {
        let mut tracker = FailureTracker::new(FailurePolicy::BestEffort);
        let (_shutdown, mut pacer) = pacer::channel(Duration::from_millis(1));
        let calls = Cell::new(0);

        for _ in 0..5 {
            let outcome = tracker
                .issue("switch", &mut pacer, || {
                    calls.set(calls.get() + 1);
                    async { failing() }
                })
                .await
                .unwrap();
            assert!(!outcome.is_success());
        }

        assert_eq!(calls.get(), 5);
        assert_eq!(tracker.total_failures(), 5);
    }

    #[tokio::test]
    async fn retry_resends_until_success() {
        let mut tracker = FailureTracker::new(FailurePolicy::Retry { attempts: 3 });
        let (_shutdown, mut pacer) = pacer::channel(Duration::from_millis(1));
        let calls = Cell::new(0);

        let outcome = tracker
            .issue("push", &mut pacer, || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 3 {
                        failing()
                    } else {
                        Outcome::ok("agent")
                    }
                }
            })
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(calls.get(), 3);
        assert_eq!(tracker.total_failures(), 0);
    }

    #[tokio::test]
    async fn retry_gives_up() {
        let mut tracker = FailureTracker::new(FailurePolicy::Retry { attempts: 2 });
        let (_shutdown, mut pacer) = pacer::channel(Duration::from_millis(1));
        let calls = Cell::new(0);

        let outcome = tracker
            .issue("push", &mut pacer, || {
                calls.set(calls.get() + 1);
                async { failing() }
            })
            .await
            .unwrap();

        assert!(!outcome.is_success());
        assert_eq!(calls.get(), 3);
        assert_eq!(tracker.total_failures(), 1);
    }

    #[tokio::test]
    async fn escalate_after_consecutive_failures() {
        let mut tracker = FailureTracker::new(FailurePolicy::Escalate {
            max_consecutive_failures: 2,
        });
        let (_shutdown, mut pacer) = pacer::channel(Duration::from_millis(1));

        assert!(tracker.issue("a", &mut pacer, || async { failing() }).await.is_ok());
        // A success resets the streak.
        let ok = tracker.issue("b", &mut pacer, || async { Outcome::ok("agent") }).await;
        assert!(ok.is_ok());
        assert!(tracker.issue("c", &mut pacer, || async { failing() }).await.is_ok());

        match tracker.issue("d", &mut pacer, || async { failing() }).await {
            Err(Halt::Failed(Error::Escalated {
                operation,
                failures,
            })) => {
                assert_eq!(operation, "d");
                assert_eq!(failures, 2);
            }
            other => panic!("expected escalation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn interrupt_stops_pending_retries() {
        let mut tracker = FailureTracker::new(FailurePolicy::Retry { attempts: 5 });
        let (shutdown, mut pacer) = pacer::channel(Duration::from_millis(1));
        let shutdown = Cell::new(Some(shutdown));
        let calls = Cell::new(0);

        let result = tracker
            .issue("switch", &mut pacer, || {
                calls.set(calls.get() + 1);
                if let Some(shutdown) = shutdown.take() {
                    shutdown.trigger();
                }
                async { failing() }
            })
            .await;

        assert!(matches!(result, Err(Halt::Cancelled)));
        assert_eq!(calls.get(), 1);
        assert_eq!(tracker.total_failures(), 0);
    }

    #[tokio::test]
    async fn cancelled_tracker_sends_nothing() {
        let mut tracker = FailureTracker::new(FailurePolicy::BestEffort);
        let (shutdown, mut pacer) = pacer::channel(Duration::from_millis(1));
        shutdown.trigger();
        let calls = Cell::new(0);

        let result = tracker
            .issue("push", &mut pacer, || {
                calls.set(calls.get() + 1);
                async { Outcome::ok("agent") }
            })
            .await;

        assert!(matches!(result, Err(Halt::Cancelled)));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn policy_from_yaml() {
        let policy: FailurePolicy = serde_yaml::from_str("kind: best_effort").unwrap();
        assert_eq!(policy, FailurePolicy::BestEffort);

        let policy: FailurePolicy =
            serde_yaml::from_str("kind: escalate\nmax_consecutive_failures: 4").unwrap();
        assert_eq!(
            policy,
            FailurePolicy::Escalate {
                max_consecutive_failures: 4
            }
        );
    }
}
