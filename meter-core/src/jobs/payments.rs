use async_trait::async_trait;
use tracing::info;

use crate::error::Error;

/// Payment bookkeeping owned by the billing side of the system.
///
/// Each step returns how many records it touched.
#[async_trait]
pub trait PaymentMaintenance: Send + Sync {
    /// Marks pending payments past their payment window as expired.
    async fn expire_stale_payments(&self) -> Result<u64, Error>;

    /// Cancels subscriptions still unpaid after their grace period.
    async fn cancel_unpaid_subscriptions(&self) -> Result<u64, Error>;

    /// Retries activation of subscriptions whose payment succeeded but whose
    /// activation failed.
    async fn retry_failed_activations(&self) -> Result<u64, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStep {
    ExpireStalePayments,
    CancelUnpaidSubscriptions,
    RetryFailedActivations,
}

impl PaymentStep {
    pub const ORDER: [PaymentStep; 3] = [
        PaymentStep::ExpireStalePayments,
        PaymentStep::CancelUnpaidSubscriptions,
        PaymentStep::RetryFailedActivations,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PaymentStep::ExpireStalePayments => "expire_stale_payments",
            PaymentStep::CancelUnpaidSubscriptions => "cancel_unpaid_subscriptions",
            PaymentStep::RetryFailedActivations => "retry_failed_activations",
        }
    }

    async fn run(self, maintenance: &dyn PaymentMaintenance) -> Result<u64, Error> {
        match self {
            PaymentStep::ExpireStalePayments => maintenance.expire_stale_payments().await,
            PaymentStep::CancelUnpaidSubscriptions => {
                maintenance.cancel_unpaid_subscriptions().await
            }
            PaymentStep::RetryFailedActivations => maintenance.retry_failed_activations().await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentReport {
    pub steps: Vec<(PaymentStep, Result<u64, Error>)>,
}

impl PaymentReport {
    pub fn failed_steps(&self) -> Vec<PaymentStep> {
        self.steps
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(step, _)| *step)
            .collect()
    }

    /// The first step failure, if any, so the run is recorded as failed.
    pub fn into_result(self) -> Result<(), Error> {
        match self.steps.into_iter().find_map(|(_, result)| result.err()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Runs every step in order. A failing step is recorded and the next step
/// still runs.
pub async fn run_payment_maintenance(maintenance: &dyn PaymentMaintenance) -> PaymentReport {
    let mut steps = Vec::with_capacity(PaymentStep::ORDER.len());
    for step in PaymentStep::ORDER {
        let result = step.run(maintenance).await;
        if let Ok(touched) = &result {
            if *touched > 0 {
                info!(step = step.name(), touched, "Payment maintenance step applied");
            }
        }
        steps.push((step, result));
    }
    PaymentReport { steps }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorDetails;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<&'static str>>,
        fail_first: bool,
    }

    impl Recording {
        fn record(&self, step: &'static str) {
            self.calls.lock().unwrap().push(step);
        }
    }

    #[async_trait]
    impl PaymentMaintenance for Recording {
        async fn expire_stale_payments(&self) -> Result<u64, Error> {
            self.record("expire");
            if self.fail_first {
                return Err(Error::new(ErrorDetails::Database {
                    message: "payments table locked".to_string(),
                }));
            }
            Ok(2)
        }

        async fn cancel_unpaid_subscriptions(&self) -> Result<u64, Error> {
            self.record("cancel");
            Ok(1)
        }

        async fn retry_failed_activations(&self) -> Result<u64, Error> {
            self.record("retry");
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let maintenance = Recording::default();
        let report = run_payment_maintenance(&maintenance).await;
        assert_eq!(
            *maintenance.calls.lock().unwrap(),
            vec!["expire", "cancel", "retry"]
        );
        assert!(report.failed_steps().is_empty());
        assert!(report.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_failed_step_does_not_stop_later_steps() {
        let maintenance = Recording {
            fail_first: true,
            ..Default::default()
        };
        let report = run_payment_maintenance(&maintenance).await;
        assert_eq!(
            *maintenance.calls.lock().unwrap(),
            vec!["expire", "cancel", "retry"]
        );
        assert_eq!(report.failed_steps(), vec![PaymentStep::ExpireStalePayments]);
        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("payments table locked"));
    }
}
