//! Handler for the `run_code` tool.
//!
//! Runs a snippet on a leased worker, forwards intermediate events as
//! progress notifications and returns the aggregated final response.

use std::pin::Pin;
use std::sync::Arc;

use rmcp::model::{CallToolResult, Content, JsonObject, ProgressNotificationParam};
use serde_json::json;
use tracing::debug;

use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::events::{DEFAULT_RUN_TIMEOUT_MS, RunCodeRequest, RunEvent};
use crate::tools::{ToolContext, ToolHandler};

pub struct RunCodeHandler {
    dispatcher: Arc<Dispatcher>,
}

impl RunCodeHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    fn parse_args(args: &JsonObject) -> Result<RunCodeRequest, DispatchError> {
        let code = match args.get("code").and_then(|v| v.as_str()) {
            Some(code) if !code.trim().is_empty() => code.to_string(),
            _ => {
                return Err(DispatchError::InvalidRequest(
                    "run_code requires a non-empty `code` string".to_string(),
                ));
            }
        };

        let timeout = match args.get("timeout") {
            None | Some(serde_json::Value::Null) => DEFAULT_RUN_TIMEOUT_MS,
            Some(v) => v.as_u64().ok_or_else(|| {
                DispatchError::InvalidRequest(
                    "`timeout` must be a non-negative integer of milliseconds".to_string(),
                )
            })?,
        };

        Ok(RunCodeRequest::new(code).with_timeout(timeout))
    }

    fn error_result(err: &DispatchError) -> CallToolResult {
        let payload = json!({
            "status": "error",
            "kind": err.kind(),
            "reason": err.to_string(),
        });
        let text = serde_json::to_string(&payload)
            .unwrap_or_else(|_| "internal serialization error".to_string());
        CallToolResult {
            content: vec![Content::text(text)],
            structured_content: Some(payload),
            is_error: Some(true),
            meta: None,
        }
    }
}

impl ToolHandler for RunCodeHandler {
    fn name(&self) -> &str {
        "run_code"
    }

    fn title(&self) -> Option<&str> {
        Some("Run Code")
    }

    fn description(&self) -> &str {
        "Execute a code snippet on a pooled worker and return its output. \
         Intermediate output is reported through progress notifications."
    }

    fn input_schema(&self) -> JsonObject {
        let mut schema = JsonObject::new();
        schema.insert("type".to_string(), json!("object"));

        let mut properties = serde_json::Map::new();
        properties.insert(
            "code".to_string(),
            json!({
                "type": "string",
                "description": "Source code to execute."
            }),
        );
        properties.insert(
            "timeout".to_string(),
            json!({
                "type": "integer",
                "minimum": 0,
                "description": "Execution timeout in milliseconds (default 30000).",
                "default": DEFAULT_RUN_TIMEOUT_MS
            }),
        );

        schema.insert("properties".to_string(), json!(properties));
        schema.insert("required".to_string(), json!(["code"]));
        schema
    }

    fn execute(
        &self,
        args: JsonObject,
        ctx: &ToolContext,
    ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<CallToolResult>> + Send + '_>> {
        let dispatcher = self.dispatcher.clone();
        let peer = ctx.request_context.peer.clone();
        let progress_token = ctx.request_context.meta.get_progress_token();

        Box::pin(async move {
            let request = Self::parse_args(&args)?;

            let mut step = 0u32;
            let outcome = dispatcher
                .run_to_completion(&request, |event: RunEvent| {
                    step += 1;
                    let progress = step;
                    let peer = peer.clone();
                    let progress_token = progress_token.clone();
                    async move {
                        let Some(progress_token) = progress_token else {
                            return;
                        };
                        let message = serde_json::to_string(&event).ok();
                        let notification = ProgressNotificationParam {
                            progress_token,
                            progress: f64::from(progress),
                            total: None,
                            message,
                        };
                        if let Err(e) = peer.notify_progress(notification).await {
                            debug!(error = %e, "Failed to send progress notification");
                        }
                    }
                })
                .await;

            match outcome {
                Ok(response) => {
                    let payload = serde_json::to_value(&response)?;
                    let text = serde_json::to_string(&payload)?;
                    Ok(CallToolResult {
                        content: vec![Content::text(text)],
                        structured_content: Some(payload),
                        is_error: Some(false),
                        meta: None,
                    })
                }
                Err(e) => Ok(Self::error_result(&e)),
            }
        })
    }
}
