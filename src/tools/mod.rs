//! Tool handler registry for the MCP surface.
//!
//! Handlers are registered by name and invoked through the registry, so the
//! `ServerHandler` implementation does not need to know about each tool.

mod registry;

pub use registry::{ToolContext, ToolHandler, ToolRegistry};

mod run_code;

pub use run_code::RunCodeHandler;
