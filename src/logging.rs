use std::{future::Future, time::Instant};

use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::ProvisionError;
use crate::provision::StepStatus;

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Awaits one provisioning step and logs its outcome and duration.
pub async fn log_step<F>(step: &'static str, work: F) -> Result<StepStatus, ProvisionError>
where
    F: Future<Output = Result<StepStatus, ProvisionError>>,
{
    let started_at = Instant::now();
    let result = work.await;
    let elapsed_ms = started_at.elapsed().as_millis();

    match &result {
        Ok(status) => info!(
            step,
            status = %status,
            duration_ms = elapsed_ms,
            "step summary"
        ),
        Err(err) => warn!(
            step,
            error = %err,
            duration_ms = elapsed_ms,
            "step failed"
        ),
    }

    result
}
