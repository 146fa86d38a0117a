// Core modules
mod config;
mod dispatcher;
mod error;
mod events;
mod pool;
mod registration;
mod worker;

// Surfaces
pub mod api;
pub mod server;
mod tools;

#[cfg(test)]
mod test_support;

// Re-export key types and functions
pub use config::{
    DEFAULT_WARMUP_CODE, DispatchSettings, load_seed_workers, resolve_workers_json_path,
};
pub use dispatcher::{AcquireMode, Dispatcher, LeasedEvents, WorkerStatus};
pub use error::DispatchError;
pub use events::{EndEvent, FinalResponse, RunCodeRequest, RunEvent, aggregate, seal};
pub use pool::{HasMaxRuns, PoolError, RoundRobinPool, RunLease};
pub use registration::RegisterWorkerRequest;
pub use server::McpServer;
pub use tools::{ToolHandler, ToolRegistry};
pub use worker::{EventStream, Worker};

use std::sync::Arc;
use anyhow::Result;
use tools::RunCodeHandler;

/// Convenience function to create a fully configured MCP server.
///
/// Creates the dispatcher, admits the seed workers that pass their warm-up
/// probe, registers the `run_code` tool and returns a `McpServer` that
/// implements rmcp's `ServerHandler`.
pub async fn create_server(
    settings: DispatchSettings,
    seeds: &[RegisterWorkerRequest],
) -> Result<Arc<McpServer>> {
    let dispatcher = Arc::new(Dispatcher::new(settings)?);
    if !seeds.is_empty() {
        let admitted = dispatcher.register_seed_workers(seeds).await;
        tracing::info!("Admitted {} of {} seed workers", admitted, seeds.len());
    }

    let tool_registry = ToolRegistry::new().register_handler(RunCodeHandler::new(dispatcher.clone()));

    let server = McpServer::new(dispatcher, Arc::new(tool_registry));

    Ok(Arc::new(server))
}
