//! Worker registration: parameter checks and the warm-up probe a candidate
//! must pass before it enters rotation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::DispatchError;
use crate::events::RunCodeRequest;
use crate::worker::Worker;

/// Request to admit a worker into the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    #[serde(rename = "workerUrl")]
    pub worker_url: Url,
    /// Run budget; `0` means unlimited.
    #[serde(rename = "maxRuns")]
    pub max_runs: i64,
}

impl RegisterWorkerRequest {
    pub fn new(worker_url: Url, max_runs: i64) -> Self {
        Self {
            worker_url,
            max_runs,
        }
    }

    /// The run budget as stored on the worker, or a validation error.
    pub fn checked_max_runs(&self) -> Result<u32, DispatchError> {
        if self.max_runs < 0 {
            return Err(DispatchError::InvalidRequest(
                "MaxRuns must be greater than or equal to 0.".to_string(),
            ));
        }
        u32::try_from(self.max_runs).map_err(|_| {
            DispatchError::InvalidRequest(format!("MaxRuns must not exceed {}.", u32::MAX))
        })
    }

    /// Check parameters, then send `warm_up` to the candidate.
    ///
    /// The whole response body is drained so a worker that fails mid-stream
    /// is caught here too.
    pub async fn validate(
        &self,
        http: &reqwest::Client,
        warm_up: &RunCodeRequest,
    ) -> Result<(), DispatchError> {
        self.checked_max_runs()?;

        let probe_failed = |reason: String| DispatchError::ProbeFailed {
            address: self.worker_url.to_string(),
            reason,
        };

        let endpoint = self
            .worker_url
            .join("/run")
            .map_err(|e| probe_failed(format!("Invalid worker url: {}", e)))?;
        let timeout = Duration::from_millis(warm_up.timeout.saturating_mul(2));
        debug!(worker_url = %self.worker_url, timeout_ms = timeout.as_millis() as u64, "Sending warm-up probe");

        let response = http
            .post(endpoint)
            .timeout(timeout)
            .json(warm_up)
            .send()
            .await
            .map_err(|e| probe_failed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| probe_failed(format!("Status code: {}, failed to read response: {}", status, e)))?;

        if !status.is_success() {
            return Err(probe_failed(format!(
                "Status code: {}, Response: {}",
                status, body
            )));
        }

        Ok(())
    }

    /// Build the pool record for this worker. Call after [`validate`](Self::validate).
    pub fn create_worker(&self) -> Result<Worker, DispatchError> {
        Ok(Worker::new(self.worker_url.clone(), self.checked_max_runs()?))
    }
}
