//! Bounded retry around a single request attempt.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use crate::model::RetryPolicy;

/// How an attempt ended, as far as retrying is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptClass {
    /// A response arrived with this status.
    Status(u16),
    /// No response within the timeout.
    Timeout,
    /// Connection refused, DNS, TLS and similar.
    Transport,
    /// Finished in a way no retry can change.
    Terminal,
}

/// Implemented by attempt outcomes so the controller can decide whether to
/// try again.
pub trait Classify {
    fn classify(&self) -> AttemptClass;
}

/// Suspends the current task between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Final outcome plus how many attempts it took.
#[derive(Debug, Clone)]
pub struct Retried<T> {
    pub outcome: T,
    pub attempts: usize,
}

pub struct RetryController<'a> {
    policy: &'a RetryPolicy,
    sleeper: &'a dyn Sleeper,
}

impl<'a> RetryController<'a> {
    pub fn new(policy: &'a RetryPolicy, sleeper: &'a dyn Sleeper) -> Self {
        Self { policy, sleeper }
    }

    /// `true` when the policy allows another attempt after `class`.
    pub fn should_retry(&self, class: AttemptClass) -> bool {
        match class {
            AttemptClass::Status(status) => {
                self.policy.retry_on_status.contains(&status)
            }
            AttemptClass::Timeout => self.policy.retry_on_timeout,
            AttemptClass::Transport => true,
            AttemptClass::Terminal => false,
        }
    }

    /// Run `attempt` until it yields a non-retryable outcome or
    /// `max_retries` extra attempts have been spent.
    pub async fn run<F, Fut, T>(&self, label: &str, mut attempt: F) -> Retried<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = T>,
        T: Classify,
    {
        let max_retries = self.policy.max_retries as usize;
        let mut index = 0;
        loop {
            let outcome = attempt().await;
            let class = outcome.classify();
            if index >= max_retries || !self.should_retry(class) {
                debug!(
                    label,
                    attempts = index + 1,
                    ?class,
                    "attempt finished"
                );
                return Retried {
                    outcome,
                    attempts: index + 1,
                };
            }

            let wait = self.policy.delay(index);
            info!(
                label,
                ?class,
                retry = index + 1,
                max_retries,
                "retrying in {:?}",
                wait
            );
            self.sleeper.sleep(wait).await;
            index += 1;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records requested sleeps instead of waiting.
    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub(crate) slept: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        pub(crate) fn total(&self) -> Duration {
            self.slept.lock().unwrap().iter().sum()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    impl Classify for AttemptClass {
        fn classify(&self) -> AttemptClass {
            *self
        }
    }

    fn policy(max_retries: u32, backoff: &[f64], statuses: &[u16]) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: backoff.to_vec(),
            retry_on_status: statuses.to_vec(),
            retry_on_timeout: true,
        }
    }

    async fn always(
        policy: &RetryPolicy,
        sleeper: &RecordingSleeper,
        class: AttemptClass,
    ) -> (Retried<AttemptClass>, usize) {
        let calls = AtomicUsize::new(0);
        let result = RetryController::new(policy, sleeper)
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { class }
            })
            .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn retryable_outcome_runs_max_retries_plus_one() {
        for n in 0..5u32 {
            let p = policy(n, &[1.0, 2.0], &[503]);
            let sleeper = RecordingSleeper::default();
            let (result, calls) =
                always(&p, &sleeper, AttemptClass::Status(503)).await;

            assert_eq!(calls, n as usize + 1);
            assert_eq!(result.attempts, n as usize + 1);
            let expected: Duration = (0..n as usize).map(|i| p.delay(i)).sum();
            assert_eq!(sleeper.total(), expected);
        }
    }

    #[tokio::test]
    async fn three_503s_report_final_status_after_two_retries() {
        let p = policy(2, &[1.0, 2.0], &[503]);
        let sleeper = RecordingSleeper::default();
        let (result, calls) = always(&p, &sleeper, AttemptClass::Status(503)).await;

        assert_eq!(calls, 3);
        assert_eq!(result.outcome, AttemptClass::Status(503));
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert_eq!(sleeper.total(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn success_is_never_retried() {
        let p = policy(3, &[1.0], &[503]);
        let sleeper = RecordingSleeper::default();
        let (result, calls) = always(&p, &sleeper, AttemptClass::Status(200)).await;
        assert_eq!(calls, 1);
        assert_eq!(result.attempts, 1);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn timeout_retry_follows_policy_flag() {
        let mut p = policy(2, &[0.1], &[]);
        let sleeper = RecordingSleeper::default();
        let (_, calls) = always(&p, &sleeper, AttemptClass::Timeout).await;
        assert_eq!(calls, 3);

        p.retry_on_timeout = false;
        let sleeper = RecordingSleeper::default();
        let (_, calls) = always(&p, &sleeper, AttemptClass::Timeout).await;
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn transport_errors_retry_and_terminal_does_not() {
        let p = policy(1, &[0.1], &[]);
        let sleeper = RecordingSleeper::default();
        let (_, calls) = always(&p, &sleeper, AttemptClass::Transport).await;
        assert_eq!(calls, 2);

        let sleeper = RecordingSleeper::default();
        let (_, calls) = always(&p, &sleeper, AttemptClass::Terminal).await;
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn stops_as_soon_as_outcome_becomes_non_retryable() {
        let p = policy(5, &[1.0, 2.0, 4.0], &[503]);
        let sleeper = RecordingSleeper::default();
        let calls = AtomicUsize::new(0);
        let result = RetryController::new(&p, &sleeper)
            .run("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        AttemptClass::Status(503)
                    } else {
                        AttemptClass::Status(200)
                    }
                }
            })
            .await;

        assert_eq!(result.outcome, AttemptClass::Status(200));
        assert_eq!(result.attempts, 3);
        assert_eq!(sleeper.total(), Duration::from_secs(3));
    }
}
