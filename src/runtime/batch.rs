use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::runner::OperationRunner;
use super::{OperationOutcome, OperationRequest};

/// Fans a sequence of requests through a shared runner.
///
/// All requests are started together; the runner's gate decides how many
/// actually call out at once, the rest queue. One outcome is returned per
/// request, in input order, whatever order they finish in.
pub struct BatchCoordinator {
    runner: Arc<OperationRunner>,
}

impl BatchCoordinator {
    pub fn new(runner: Arc<OperationRunner>) -> Self {
        Self { runner }
    }

    pub async fn run_batch(&self, requests: Vec<OperationRequest>) -> Vec<OperationOutcome> {
        debug!(
            size = requests.len(),
            limit = self.runner.gate().limit(),
            "starting batch"
        );
        let futures: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let runner = Arc::clone(&self.runner);
                async move { runner.run(request).await }
            })
            .collect();

        futures::future::join_all(futures).await
    }
}

/// Success/failure counts for a finished batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl From<&[OperationOutcome]> for BatchReport {
    fn from(outcomes: &[OperationOutcome]) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        Self {
            total: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FailureKind;
    use serde_json::json;

    #[test]
    fn report_counts_outcomes() {
        let outcomes = vec![
            OperationOutcome::Success {
                value: json!(1),
                attempts: 1,
            },
            OperationOutcome::Failure {
                kind: FailureKind::Exhausted,
                attempts: 2,
                error: "x".into(),
                timed_out: false,
            },
            OperationOutcome::Success {
                value: json!(3),
                attempts: 1,
            },
        ];
        assert_eq!(
            BatchReport::from(outcomes.as_slice()),
            BatchReport {
                total: 3,
                succeeded: 2,
                failed: 1
            }
        );
    }

    #[test]
    fn empty_report() {
        assert_eq!(BatchReport::from(&[][..]), BatchReport::default());
    }
}
