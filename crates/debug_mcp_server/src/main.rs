use std::{path::PathBuf, sync::Arc, time::Duration};

use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use debug_engine::{
    DefaultsStore, EngineConfig, LaunchSpec, Session, SessionRegistry, TargetSpec,
};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerLaunchParams {
    /// Executable path to launch directly under the debugger.
    #[serde(default)]
    executable: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    /// Bundle identifier started via the platform launch service and
    /// attached to. Mutually exclusive with `executable`.
    #[serde(default)]
    bundle_id: Option<String>,
    #[serde(default)]
    stop_at_entry: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerAttachParams {
    pid: u32,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerSendCommandParams {
    command: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerTargetParams {
    #[serde(default)]
    target: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerAddBreakpointParams {
    /// `file:line` or a symbol name.
    location: String,
    #[serde(default)]
    target: Option<String>,
}

fn to_mcp_error(message: impl Into<String>) -> McpError {
    McpError::internal_error(message.into(), None)
}

/// Resolves the launch target from explicit parameters, falling back to
/// the shared defaults record when the caller specified nothing.
fn resolve_target(
    params: &DebuggerLaunchParams,
    default_target: Option<TargetSpec>,
) -> Result<TargetSpec, String> {
    match (&params.executable, &params.bundle_id) {
        (Some(_), Some(_)) => {
            Err("Specify either 'executable' or 'bundle_id', not both.".to_string())
        }
        (Some(path), None) => Ok(TargetSpec::Executable {
            path: PathBuf::from(path),
            args: params.args.clone(),
        }),
        (None, Some(id)) => Ok(TargetSpec::Bundle { id: id.clone() }),
        (None, None) => default_target.ok_or_else(|| {
            "No target specified and no default target is recorded. \
             Pass 'executable' or 'bundle_id'."
                .to_string()
        }),
    }
}

fn session_result(session: &Session) -> CallToolResult {
    CallToolResult::structured(json!({
        "ok": true,
        "target": session.target_key(),
        "state": session.state(),
        "pid": session.pid(),
        "crash_reason": session.crash_reason(),
    }))
}

#[derive(Clone)]
struct DebugMcpServer {
    tool_router: ToolRouter<Self>,
    config: EngineConfig,
    registry: Arc<SessionRegistry>,
    defaults: Arc<DefaultsStore>,
}

#[tool_router]
impl DebugMcpServer {
    fn new(config: EngineConfig) -> Self {
        let defaults = Arc::new(DefaultsStore::new(config.defaults_path.clone()));
        let registry = Arc::new(SessionRegistry::new(config.clone()));
        Self {
            tool_router: Self::tool_router(),
            config,
            registry,
            defaults,
        }
    }

    /// One session per target: a named target resolves directly, an
    /// omitted one requires exactly one live session to be unambiguous.
    async fn resolve_session(&self, target: Option<&str>) -> Result<Session, McpError> {
        if let Some(key) = target {
            return self.registry.get(key).await.ok_or_else(|| {
                to_mcp_error(format!(
                    "No live session for target '{key}'. Call debugger_launch first."
                ))
            });
        }
        let sessions = self.registry.list().await;
        match sessions.as_slice() {
            [] => Err(to_mcp_error(
                "No live debug session. Call debugger_launch first.",
            )),
            [only] => self.registry.get(&only.target).await.ok_or_else(|| {
                to_mcp_error(format!("Session '{}' just ended.", only.target))
            }),
            many => Err(to_mcp_error(format!(
                "Multiple sessions are live ({}); pass 'target' to pick one.",
                many.iter()
                    .map(|info| info.target.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    #[tool(
        description = "Launch a target under the debugger (or reuse the live session for it) and report its state"
    )]
    async fn debugger_launch(
        &self,
        params: Parameters<DebuggerLaunchParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let target =
            resolve_target(&params, self.defaults.default_target()).map_err(to_mcp_error)?;
        let spec = LaunchSpec {
            target,
            stop_at_entry: params.stop_at_entry,
        };

        // A crashed launch still comes back as a session so callers can
        // read the reason from the structured result.
        let session = self
            .registry
            .obtain(&spec)
            .await
            .map_err(|e| to_mcp_error(e.to_string()))?;

        Ok(session_result(&session))
    }

    #[tool(description = "Attach the debugger to an already-running process id")]
    async fn debugger_attach(
        &self,
        params: Parameters<DebuggerAttachParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let spec = LaunchSpec {
            target: TargetSpec::Pid(params.pid),
            stop_at_entry: true,
        };
        let session = self
            .registry
            .obtain(&spec)
            .await
            .map_err(|e| to_mcp_error(e.to_string()))?;
        Ok(session_result(&session))
    }

    #[tool(description = "Run one debugger console command in a live session and return its output")]
    async fn debugger_send_command(
        &self,
        params: Parameters<DebuggerSendCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.resolve_session(params.target.as_deref()).await?;

        let timeout = params.timeout_ms.map(Duration::from_millis);
        let result = session
            .send_command(&params.command, timeout)
            .await
            .map_err(|e| to_mcp_error(e.to_string()))?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "target": session.target_key(),
            "state": result.state,
            "output": result.output,
            "crash_reason": result.crash_reason,
        })))
    }

    #[tool(description = "Interrupt a running target and wait for it to stop")]
    async fn debugger_interrupt(
        &self,
        params: Parameters<DebuggerTargetParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.resolve_session(params.target.as_deref()).await?;
        let result = session
            .interrupt()
            .await
            .map_err(|e| to_mcp_error(e.to_string()))?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "target": session.target_key(),
            "state": result.state,
            "output": result.output,
            "crash_reason": result.crash_reason,
        })))
    }

    #[tool(description = "Set a breakpoint at file:line or a symbol name")]
    async fn debugger_add_breakpoint(
        &self,
        params: Parameters<DebuggerAddBreakpointParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.resolve_session(params.target.as_deref()).await?;
        let breakpoint = session
            .add_breakpoint(&params.location)
            .await
            .map_err(|e| to_mcp_error(e.to_string()))?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "target": session.target_key(),
            "breakpoint": breakpoint,
        })))
    }

    #[tool(description = "List the breakpoints known to a live session")]
    async fn debugger_list_breakpoints(
        &self,
        params: Parameters<DebuggerTargetParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.resolve_session(params.target.as_deref()).await?;
        let breakpoints = session.list_breakpoints().await;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "target": session.target_key(),
            "breakpoints": breakpoints,
        })))
    }

    #[tool(description = "Detach the debugger, leaving the target running")]
    async fn debugger_detach(
        &self,
        params: Parameters<DebuggerTargetParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.resolve_session(params.target.as_deref()).await?;
        let state = session.detach().await;
        self.registry.remove(session.target_key()).await;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "target": session.target_key(),
            "state": state,
        })))
    }

    #[tool(description = "Kill the target and end its debug session")]
    async fn debugger_terminate(
        &self,
        params: Parameters<DebuggerTargetParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.resolve_session(params.target.as_deref()).await?;
        let state = session.terminate().await;
        self.registry.remove(session.target_key()).await;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "target": session.target_key(),
            "state": state,
        })))
    }

    #[tool(description = "List live debug sessions with their state and pid")]
    async fn debugger_sessions(&self) -> Result<CallToolResult, McpError> {
        let sessions = self.registry.list().await;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "debugger": self.config.debugger_path.display().to_string(),
            "sessions": sessions,
        })))
    }
}

#[tool_handler]
impl ServerHandler for DebugMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Debug MCP Server holding persistent interactive debugger sessions per target"
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = EngineConfig::from_env();
    let server = DebugMcpServer::new(config);
    let transport = transport::stdio();

    tracing::info!("Starting Debug MCP Server on stdio...");

    server.serve(transport).await?.waiting().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch_params(
        executable: Option<&str>,
        bundle_id: Option<&str>,
    ) -> DebuggerLaunchParams {
        DebuggerLaunchParams {
            executable: executable.map(str::to_string),
            args: vec![],
            bundle_id: bundle_id.map(str::to_string),
            stop_at_entry: false,
        }
    }

    #[test]
    fn resolve_target_prefers_explicit_executable() {
        let target = resolve_target(
            &launch_params(Some("/tmp/echo-loop"), None),
            Some(TargetSpec::Bundle {
                id: "com.example.default".to_string(),
            }),
        )
        .expect("explicit target wins");
        assert_eq!(
            target,
            TargetSpec::Executable {
                path: PathBuf::from("/tmp/echo-loop"),
                args: vec![]
            }
        );
    }

    #[test]
    fn resolve_target_falls_back_to_defaults_record() {
        let target = resolve_target(
            &launch_params(None, None),
            Some(TargetSpec::Bundle {
                id: "com.example.default".to_string(),
            }),
        )
        .expect("defaults fill the gap");
        assert_eq!(
            target,
            TargetSpec::Bundle {
                id: "com.example.default".to_string()
            }
        );
    }

    #[test]
    fn resolve_target_rejects_ambiguous_and_empty_requests() {
        let err = resolve_target(
            &launch_params(Some("/tmp/echo-loop"), Some("com.example.demo")),
            None,
        )
        .expect_err("both kinds at once");
        assert!(err.contains("not both"), "unexpected error: {err}");

        let err = resolve_target(&launch_params(None, None), None)
            .expect_err("nothing specified, nothing recorded");
        assert!(err.contains("No target specified"), "unexpected error: {err}");
    }

    #[test]
    fn launch_params_schema_has_no_bare_true_for_args() {
        let schema = schemars::schema_for!(DebuggerLaunchParams);
        let json = serde_json::to_string(&schema).expect("schema serialization must succeed");
        assert!(
            !json.contains("\"args\":true") && !json.contains("\"args\": true"),
            "Schema contains bare 'true' for args field:\n{}",
            serde_json::to_string_pretty(&schema)
                .expect("pretty schema serialization must succeed")
        );
    }
}
