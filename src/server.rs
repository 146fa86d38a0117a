//! MCP server implementation using rmcp.
//!
//! Exposes the `run_code` tool and serves it, together with the REST API,
//! on a single HTTP listener.

use std::sync::Arc;

use anyhow::Result;
use rmcp::transport::streamable_http_server::{
    StreamableHttpService, session::local::LocalSessionManager,
};
use rmcp::{
    ErrorData as McpError,
    handler::server::ServerHandler,
    model::*,
    service::{RequestContext, RoleServer},
};
use tracing::info;

use crate::dispatcher::Dispatcher;
use crate::tools::{ToolContext, ToolRegistry};

/// MCP server that handles protocol requests and delegates to tool handlers.
#[derive(Clone)]
pub struct McpServer {
    dispatcher: Arc<Dispatcher>,
    tool_registry: Arc<ToolRegistry>,
}

impl McpServer {
    pub fn new(dispatcher: Arc<Dispatcher>, tool_registry: Arc<ToolRegistry>) -> Self {
        Self {
            dispatcher,
            tool_registry,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn tool_registry(&self) -> &Arc<ToolRegistry> {
        &self.tool_registry
    }
}

impl ServerHandler for McpServer {
    fn ping(
        &self,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<(), McpError>> + Send + '_ {
        std::future::ready(Ok(()))
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let result = ListToolsResult {
            tools: self.tool_registry.list_tools(),
            next_cursor: None,
            ..Default::default()
        };
        std::future::ready(Ok(result))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let tool_name = request.name.to_string();
        let args = request.arguments.unwrap_or_default();
        let registry = self.tool_registry.clone();

        async move {
            let ctx = ToolContext {
                request_context: context,
            };
            registry.call_tool(&tool_name, args, &ctx).await
        }
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Runs code snippets on a pool of remote executor workers. \
                 Call `run_code` with the source to execute; pass a progress token \
                 to receive output as it is produced."
                    .to_string(),
            ),
        }
    }
}

/// Serve the REST API and the MCP endpoint (`/mcp`) on `bind`, e.g.
/// `0.0.0.0:5050`.
///
/// On Ctrl-C the dispatcher is shut down, so requests still waiting for a
/// worker fail, and the listener stops accepting connections.
pub async fn start_http(server: Arc<McpServer>, bind: &str) -> Result<()> {
    let dispatcher = server.dispatcher().clone();

    let service = StreamableHttpService::new(
        {
            let server = server.clone();
            move || Ok(server.as_ref().clone())
        },
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let router = crate::api::create_router(dispatcher.clone()).nest_service("/mcp", service);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Runner host listening on http://{} (REST under /api, MCP at /mcp)", bind);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutdown requested, closing worker pool");
            dispatcher.shutdown();
        })
        .await?;

    Ok(())
}
