//! Tool registry for the MCP surface.
//!
//! Tools implement [`ToolHandler`]; the [`ToolRegistry`] lists them for
//! `tools/list` and routes `tools/call` by name, turning handler failures
//! into MCP errors.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use rmcp::ErrorData as McpError;
use rmcp::RoleServer;
use rmcp::model::{CallToolResult, JsonObject, Tool as McpTool};
use rmcp::service::RequestContext;

use crate::error::DispatchError;

/// Context passed to tool handlers during execution.
#[derive(Clone)]
pub struct ToolContext {
    /// Request context from rmcp: the peer used for progress notifications
    /// and the request meta carrying the caller's progress token.
    pub request_context: RequestContext<RoleServer>,
}

/// A tool exposed over MCP.
///
/// A handler reports failures of the work it performs inside the returned
/// `CallToolResult` with `is_error` set. Returning `Err` means the call
/// itself was rejected; a [`DispatchError`] keeps its kind on the way out.
pub trait ToolHandler: Send + Sync {
    /// Name clients use in `tools/call`, e.g. `run_code`.
    fn name(&self) -> &str;

    fn title(&self) -> Option<&str> {
        None
    }

    fn description(&self) -> &str;

    /// JSON schema of the call arguments.
    fn input_schema(&self) -> JsonObject;

    fn output_schema(&self) -> Option<JsonObject> {
        None
    }

    fn execute(
        &self,
        args: JsonObject,
        ctx: &ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<CallToolResult>> + Send + '_>>;

    /// Describe this handler for `tools/list`.
    fn to_mcp_tool(&self) -> McpTool {
        use std::borrow::Cow;

        McpTool {
            name: Cow::Owned(self.name().to_string()),
            title: self.title().map(|s| s.to_string()),
            description: Some(Cow::Owned(self.description().to_string())),
            input_schema: Arc::new(self.input_schema()),
            output_schema: self.output_schema().map(Arc::new),
            annotations: None,
            icons: None,
            meta: None,
        }
    }
}

/// Handlers keyed by tool name; listed in name order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handler`, replacing any tool registered under the same name.
    pub fn register_handler<T: ToolHandler + 'static>(mut self, handler: T) -> Self {
        self.handlers
            .insert(handler.name().to_string(), Arc::new(handler));
        self
    }

    pub fn list_tools(&self) -> Vec<McpTool> {
        self.handlers
            .values()
            .map(|handler| handler.to_mcp_tool())
            .collect()
    }

    /// Run the tool called `name`.
    ///
    /// An unknown name is `invalid_params`. A rejected call keeps the MCP
    /// code of its [`DispatchError`], anything else is an internal error.
    pub async fn call_tool(
        &self,
        name: &str,
        args: JsonObject,
        ctx: &ToolContext,
    ) -> Result<CallToolResult, McpError> {
        let handler = self
            .handlers
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::invalid_params(format!("Unknown tool: {}", name), None))?;
        handler.execute(args, ctx).await.map_err(tool_error)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

fn tool_error(err: anyhow::Error) -> McpError {
    match err.downcast_ref::<DispatchError>() {
        Some(dispatch) => dispatch.to_mcp_error(),
        None => McpError::internal_error(format!("Tool execution failed: {}", err), None),
    }
}
