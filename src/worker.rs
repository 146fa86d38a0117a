//! A remote executor worker: its usage bookkeeping and the HTTP calls that
//! run code on it.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use eventsource_stream::{EventStreamError, Eventsource};
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use tracing::debug;
use url::Url;

use crate::error::DispatchError;
use crate::events::{RunCodeRequest, RunEvent};
use crate::pool::HasMaxRuns;

/// Ordered, single-pass stream of events decoded from one run.
///
/// Ends after the first `end` event or the first error. Dropping it closes
/// the connection to the worker.
pub type EventStream = BoxStream<'static, Result<RunEvent, DispatchError>>;

/// One registered worker. Identity is its URL.
#[derive(Debug)]
pub struct Worker {
    url: Url,
    max_runs: u32,
    current_runs: AtomicU32,
    registered_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(url: Url, max_runs: u32) -> Self {
        Self {
            url,
            max_runs,
            current_runs: AtomicU32::new(0),
            registered_at: Utc::now(),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    fn run_endpoint(&self) -> Result<Url, DispatchError> {
        self.url.join("/run").map_err(|e| {
            DispatchError::InvalidRequest(format!("Invalid worker url {}: {}", self.url, e))
        })
    }

    /// Post `request` to the worker and return as soon as the response
    /// headers arrive, leaving the body unread.
    pub async fn run(
        &self,
        http: &reqwest::Client,
        request: &RunCodeRequest,
        timeout: Duration,
    ) -> Result<reqwest::Response, DispatchError> {
        let endpoint = self.run_endpoint()?;
        debug!(worker = %self.url, timeout_ms = timeout.as_millis() as u64, "Sending run request");

        http.post(endpoint)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| DispatchError::Unreachable {
                address: self.url.to_string(),
                reason: e.to_string(),
            })
    }

    /// Run `request` and decode the streamed response into events.
    ///
    /// A non-success status fails here, before any event is produced.
    pub async fn run_as_events(
        &self,
        http: &reqwest::Client,
        request: &RunCodeRequest,
        timeout: Duration,
    ) -> Result<EventStream, DispatchError> {
        let response = self.run(http, request, timeout).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read response: {}>", e));
            return Err(DispatchError::WorkerUnavailable {
                address: self.url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let address = self.url.to_string();
        let events = response
            .bytes_stream()
            .eventsource()
            .map(move |message| match message {
                Ok(message) => serde_json::from_str::<RunEvent>(&message.data).map_err(|e| {
                    DispatchError::StreamDecode(format!("{} (payload: {})", e, message.data))
                }),
                Err(EventStreamError::Transport(e)) => Err(DispatchError::Unreachable {
                    address: address.clone(),
                    reason: e.to_string(),
                }),
                Err(e) => Err(DispatchError::StreamDecode(e.to_string())),
            })
            .scan(false, |finished, item| {
                if *finished {
                    return future::ready(None);
                }
                *finished = matches!(&item, Ok(RunEvent::End(_)) | Err(_));
                future::ready(Some(item))
            });

        Ok(events.boxed())
    }
}

impl PartialEq for Worker {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for Worker {}

impl Hash for Worker {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
    }
}

impl HasMaxRuns for Worker {
    fn max_runs(&self) -> u32 {
        self.max_runs
    }

    fn current_runs(&self) -> u32 {
        self.current_runs.load(Ordering::Acquire)
    }

    fn record_run(&self) -> u32 {
        let previous = self
            .current_runs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |runs| {
                Some(runs.saturating_add(1))
            })
            .unwrap_or_else(|runs| runs);
        previous.saturating_add(1)
    }
}
