//! Dispatch controller: leases a worker for each run, streams its events back
//! and guarantees the lease is returned on every exit path.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::error::DispatchError;
use crate::events::{FinalResponse, RunCodeRequest, RunEvent, aggregate};
use crate::pool::{HasMaxRuns, RoundRobinPool, RunLease};
use crate::registration::RegisterWorkerRequest;
use crate::worker::{EventStream, Worker};

/// How a caller waits for a free worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Suspend until a worker is returned or registered.
    Wait,
    /// Fail with [`DispatchError::PoolEmpty`] if none is free right now.
    FailFast,
}

/// Status of one registered worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    #[serde(rename = "workerUrl")]
    pub worker_url: Url,
    #[serde(rename = "maxRuns")]
    pub max_runs: u32,
    #[serde(rename = "currentRuns")]
    pub current_runs: u32,
    pub leased: bool,
    pub retiring: bool,
    #[serde(rename = "registeredAt")]
    pub registered_at: DateTime<Utc>,
}

/// Events of one run, bound to the lease of the worker producing them.
///
/// The lease goes back to the pool as soon as the events are exhausted, or
/// when this stream is dropped.
pub struct LeasedEvents {
    lease: RunLease<Worker>,
    events: EventStream,
}

impl LeasedEvents {
    pub fn worker_url(&self) -> &Url {
        self.lease.url()
    }
}

impl Stream for LeasedEvents {
    type Item = Result<RunEvent, DispatchError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let next = self.events.poll_next_unpin(cx);
        if let Poll::Ready(None) = next {
            self.lease.release();
        }
        next
    }
}

/// Shared entry point for registration and dispatch.
pub struct Dispatcher {
    pool: RoundRobinPool<Worker>,
    http: reqwest::Client,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(settings: DispatchSettings) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self::with_client(http, settings))
    }

    pub fn with_client(http: reqwest::Client, settings: DispatchSettings) -> Self {
        Self {
            pool: RoundRobinPool::new(),
            http,
            settings,
        }
    }

    pub fn pool(&self) -> &RoundRobinPool<Worker> {
        &self.pool
    }

    /// Probe the candidate and admit it on success.
    pub async fn register_worker(&self, request: &RegisterWorkerRequest) -> Result<(), DispatchError> {
        request
            .validate(&self.http, &self.settings.warm_up_request())
            .await?;

        let worker = request.create_worker()?;
        if self.pool.add(worker) {
            info!(worker_url = %request.worker_url, max_runs = request.max_runs, "Worker registered");
        } else {
            debug!(worker_url = %request.worker_url, "Worker already registered");
        }
        Ok(())
    }

    /// Register every seed worker, logging the ones that fail their probe.
    /// Returns how many were admitted.
    pub async fn register_seed_workers(&self, seeds: &[RegisterWorkerRequest]) -> usize {
        let mut admitted = 0;
        for seed in seeds {
            match self.register_worker(seed).await {
                Ok(()) => admitted += 1,
                Err(e) => warn!(worker_url = %seed.worker_url, error = %e, "Seed worker rejected"),
            }
        }
        admitted
    }

    /// Take a worker out of rotation. A worker that is mid-run finishes first.
    pub fn unregister_worker(&self, worker_url: &Url) -> bool {
        let removed = self.pool.remove(&Worker::new(worker_url.clone(), 0));
        if removed {
            info!(worker_url = %worker_url, "Worker unregistered");
        }
        removed
    }

    /// Registered workers, including those currently running code.
    pub fn worker_count(&self) -> usize {
        self.pool.count()
    }

    pub fn workers(&self) -> Vec<WorkerStatus> {
        let mut workers: Vec<WorkerStatus> = self
            .pool
            .members()
            .into_iter()
            .map(|member| WorkerStatus {
                worker_url: member.item.url().clone(),
                max_runs: member.item.max_runs(),
                current_runs: member.item.current_runs(),
                leased: member.leased,
                retiring: member.retiring,
                registered_at: member.item.registered_at(),
            })
            .collect();
        workers.sort_by_key(|w| w.registered_at);
        workers
    }

    pub async fn lease(&self, mode: AcquireMode) -> Result<RunLease<Worker>, DispatchError> {
        let lease = match mode {
            AcquireMode::Wait => self.pool.acquire().await?,
            AcquireMode::FailFast => self.pool.try_acquire()?,
        };
        Ok(lease)
    }

    /// Lease a worker and start `request` on it.
    ///
    /// Resolves once the worker has accepted the run; the returned stream
    /// then yields its events as they arrive.
    pub async fn submit(
        &self,
        request: &RunCodeRequest,
        mode: AcquireMode,
    ) -> Result<LeasedEvents, DispatchError> {
        let lease = self.lease(mode).await?;
        let run_id = Uuid::new_v4();
        debug!(%run_id, worker = %lease.url(), "Leased worker for run");

        let events = lease
            .run_as_events(&self.http, request, self.settings.run_timeout(request))
            .await
            .inspect_err(|e| warn!(%run_id, worker = %lease.url(), error = %e, "Run rejected"))?;

        Ok(LeasedEvents { lease, events })
    }

    /// Run `request` to completion, reporting every intermediate event
    /// through `on_progress`.
    pub async fn run_to_completion<F, Fut>(
        &self,
        request: &RunCodeRequest,
        on_progress: F,
    ) -> Result<FinalResponse, DispatchError>
    where
        F: FnMut(RunEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let started = Instant::now();
        let events = self.submit(request, AcquireMode::Wait).await?;
        let address = events.worker_url().to_string();

        let response = aggregate(events, &address, on_progress).await;
        info!(
            worker = %address,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = response.is_ok(),
            "Run finished"
        );
        response
    }

    /// Stop handing out workers. Callers waiting for one fail with
    /// [`DispatchError::Cancelled`].
    pub fn shutdown(&self) {
        self.pool.close();
    }
}
