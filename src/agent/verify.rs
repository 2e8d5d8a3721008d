//! Delta verification: after a side effect, poll an observable signal until it
//! has moved by the expected amount.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::debug;

use super::resume::ResumptionState;

/// Tolerance for comparing money amounts read back from a page.
pub fn epsilon() -> Decimal {
    Decimal::new(1, 5)
}

/// Whether `current` has reached `baseline + expected`, within [`epsilon`].
pub fn threshold_met(current: Decimal, baseline: Decimal, expected: Decimal) -> bool {
    current + epsilon() >= baseline + expected
}

/// Something the verifier can read a number from. `None` means unreadable right now.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn read(&self) -> Option<Decimal>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified { current: Decimal, needed: Decimal },
    /// Verification cannot be decided; the task is left for an operator.
    Impasse(String),
}

pub struct Verifier {
    interval: Duration,
}

impl Verifier {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Poll until the threshold is met. There is no ceiling: the caller bounds
    /// the wait by how long it keeps the surface alive.
    pub async fn run(&self, state: &ResumptionState, signal: &dyn SignalSource) -> VerifyOutcome {
        let (Some(baseline), Some(expected)) = (state.baseline, state.expected_delta) else {
            return VerifyOutcome::Impasse(format!(
                "Missing baseline or expected delta for task {}",
                state.task_id
            ));
        };
        let needed = baseline + expected;
        loop {
            match signal.read().await {
                Some(current) if threshold_met(current, baseline, expected) => {
                    return VerifyOutcome::Verified { current, needed };
                }
                current => {
                    debug!(task_id = %state.task_id, current = ?current, needed = %needed, "Waiting for balance");
                }
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::{Task, TaskType};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct Scripted {
        values: Mutex<VecDeque<Option<Decimal>>>,
        reads: AtomicUsize,
    }

    impl Scripted {
        fn new(values: Vec<Option<Decimal>>) -> Self {
            Self {
                values: Mutex::new(values.into()),
                reads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SignalSource for Scripted {
        async fn read(&self) -> Option<Decimal> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut values = self.values.lock().await;
            if values.len() > 1 {
                values.pop_front().flatten()
            } else {
                values.front().copied().flatten()
            }
        }
    }

    fn state(baseline: Option<Decimal>, expected: Option<Decimal>) -> ResumptionState {
        let task = Task::new(TaskType::AnycardLoad, json!({}));
        let mut s = ResumptionState::for_task(&task);
        s.baseline = baseline;
        s.expected_delta = expected;
        s.mark_submitted();
        s
    }

    #[tokio::test]
    async fn verifies_on_the_poll_that_crosses() {
        let signal = Scripted::new(vec![Some(dec!(10)), Some(dec!(10)), Some(dec!(15))]);
        let outcome = Verifier::new(Duration::from_millis(1))
            .run(&state(Some(dec!(10)), Some(dec!(5))), &signal)
            .await;
        assert_eq!(
            outcome,
            VerifyOutcome::Verified {
                current: dec!(15),
                needed: dec!(15)
            }
        );
        assert_eq!(signal.reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unreadable_polls_keep_waiting() {
        let signal = Scripted::new(vec![None, Some(dec!(9.999995))]);
        let outcome = Verifier::new(Duration::from_millis(1))
            .run(&state(Some(dec!(5)), Some(dec!(5))), &signal)
            .await;
        assert!(matches!(outcome, VerifyOutcome::Verified { .. }));
    }

    #[tokio::test]
    async fn missing_baseline_is_impasse() {
        let signal = Scripted::new(vec![Some(dec!(100))]);
        let outcome = Verifier::new(Duration::from_millis(1))
            .run(&state(None, Some(dec!(5))), &signal)
            .await;
        assert!(matches!(outcome, VerifyOutcome::Impasse(_)));
        assert_eq!(signal.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn threshold_uses_epsilon() {
        assert!(threshold_met(dec!(14.999995), dec!(10), dec!(5)));
        assert!(!threshold_met(dec!(14.9999), dec!(10), dec!(5)));
    }
}
