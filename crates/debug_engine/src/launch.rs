use std::path::PathBuf;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// What to debug, and how it can be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    /// A plain command-line executable the debugger can exec directly.
    Executable { path: PathBuf, args: Vec<String> },
    /// A sandboxed/GUI bundle that rejects direct exec under the debugger;
    /// it must be started by the platform launch service and attached to.
    Bundle { id: String },
    /// An already-running process to attach to.
    Pid(u32),
}

impl TargetSpec {
    /// Stable identity string used as the registry key.
    pub fn key(&self) -> String {
        match self {
            TargetSpec::Executable { path, .. } => format!("exec:{}", path.display()),
            TargetSpec::Bundle { id } => format!("bundle:{id}"),
            TargetSpec::Pid(pid) => format!("pid:{pid}"),
        }
    }
}

/// One launch/attach request as the registry receives it.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub target: TargetSpec,
    pub stop_at_entry: bool,
}

/// The concrete way a session will bring its target under the debugger:
/// arguments for the debugger spawn plus the command lines issued right
/// after the prompt appears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub debugger_args: Vec<String>,
    pub commands: Vec<String>,
    /// Known in advance only for the attach paths.
    pub attach_pid: Option<u32>,
}

fn base_debugger_args() -> Vec<String> {
    vec!["--no-use-colors".to_string()]
}

/// Strategy selection is by target-type inspection, not inheritance: each
/// implementation produces a `LaunchPlan`, and failures surface as
/// `LaunchFailed` carrying the underlying diagnostic text.
#[async_trait]
pub trait LaunchStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn plan(&self, spec: &LaunchSpec, config: &EngineConfig) -> Result<LaunchPlan>;
}

pub fn strategy_for(target: &TargetSpec) -> Box<dyn LaunchStrategy> {
    match target {
        TargetSpec::Executable { .. } | TargetSpec::Pid(_) => Box::new(DirectSpawn),
        TargetSpec::Bundle { .. } => Box::new(ServiceLaunch),
    }
}

/// Spawns the debugger with the target as its argument, or attaches to an
/// existing pid. Works for anything that tolerates direct exec.
pub struct DirectSpawn;

#[async_trait]
impl LaunchStrategy for DirectSpawn {
    fn name(&self) -> &'static str {
        "direct-spawn"
    }

    async fn plan(&self, spec: &LaunchSpec, _config: &EngineConfig) -> Result<LaunchPlan> {
        match &spec.target {
            TargetSpec::Executable { path, args } => {
                let mut debugger_args = base_debugger_args();
                debugger_args.push("--".to_string());
                debugger_args.push(path.display().to_string());
                debugger_args.extend(args.iter().cloned());

                let launch_cmd = if spec.stop_at_entry {
                    "process launch --stop-at-entry".to_string()
                } else {
                    "process launch".to_string()
                };

                Ok(LaunchPlan {
                    debugger_args,
                    commands: vec![launch_cmd],
                    attach_pid: None,
                })
            }
            TargetSpec::Pid(pid) => {
                // Attach leaves the target stopped; resume unless the
                // caller asked to inspect the entry state.
                let mut commands = vec![format!("process attach --pid {pid}")];
                if !spec.stop_at_entry {
                    commands.push("process continue".to_string());
                }
                Ok(LaunchPlan {
                    debugger_args: base_debugger_args(),
                    commands,
                    attach_pid: Some(*pid),
                })
            }
            TargetSpec::Bundle { id } => Err(EngineError::LaunchFailed(format!(
                "bundle target '{id}' requires the launch service strategy"
            ))),
        }
    }
}

/// Asks the platform's process-launch facility to start the target
/// suspended, reads the new process id from its output, then has the
/// debugger attach to that id. Required where direct exec fails signing or
/// entitlement checks.
pub struct ServiceLaunch;

pub(crate) fn parse_launched_pid(output: &str) -> Option<u32> {
    // Launcher output ends in "<identity>: <pid>"; take the last integer.
    let re = Regex::new(r"(\d+)").unwrap();
    re.find_iter(output)
        .last()
        .and_then(|m| m.as_str().parse().ok())
}

#[async_trait]
impl LaunchStrategy for ServiceLaunch {
    fn name(&self) -> &'static str {
        "service-launch"
    }

    async fn plan(&self, spec: &LaunchSpec, config: &EngineConfig) -> Result<LaunchPlan> {
        let TargetSpec::Bundle { id } = &spec.target else {
            return Err(EngineError::LaunchFailed(
                "launch service strategy only handles bundle targets".to_string(),
            ));
        };

        debug!("launching bundle '{id}' via {}", config.launcher_path.display());
        let output = tokio::process::Command::new(&config.launcher_path)
            .args(["launch", "--wait-for-debugger", id])
            .output()
            .await
            .map_err(|e| {
                EngineError::LaunchFailed(format!(
                    "launch service '{}' failed to start: {e}",
                    config.launcher_path.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::LaunchFailed(format!(
                "launch service rejected '{id}': {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let pid = parse_launched_pid(&stdout).ok_or_else(|| {
            EngineError::LaunchFailed(format!(
                "launch service output for '{id}' contained no process id: {}",
                stdout.trim()
            ))
        })?;
        info!("bundle '{id}' launched suspended as pid {pid}");

        let mut commands = vec![format!("process attach --pid {pid}")];
        if !spec.stop_at_entry {
            commands.push("process continue".to_string());
        }

        Ok(LaunchPlan {
            debugger_args: base_debugger_args(),
            commands,
            attach_pid: Some(pid),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_direct_spawn_executable_plan() {
        let spec = LaunchSpec {
            target: TargetSpec::Executable {
                path: PathBuf::from("/tmp/echo-loop"),
                args: vec!["--count".to_string(), "3".to_string()],
            },
            stop_at_entry: true,
        };
        let plan = DirectSpawn
            .plan(&spec, &EngineConfig::default())
            .await
            .expect("plan");
        assert_eq!(
            plan.debugger_args,
            vec!["--no-use-colors", "--", "/tmp/echo-loop", "--count", "3"]
        );
        assert_eq!(plan.commands, vec!["process launch --stop-at-entry"]);
        assert_eq!(plan.attach_pid, None);
    }

    #[tokio::test]
    async fn test_direct_spawn_pid_attach_plan() {
        let spec = LaunchSpec {
            target: TargetSpec::Pid(4242),
            stop_at_entry: true,
        };
        let plan = DirectSpawn
            .plan(&spec, &EngineConfig::default())
            .await
            .expect("plan");
        assert_eq!(plan.commands, vec!["process attach --pid 4242"]);
        assert_eq!(plan.attach_pid, Some(4242));
    }

    #[tokio::test]
    async fn test_service_launch_missing_launcher_is_launch_failed() {
        let spec = LaunchSpec {
            target: TargetSpec::Bundle {
                id: "com.example.demo".to_string(),
            },
            stop_at_entry: false,
        };
        let config = EngineConfig {
            launcher_path: PathBuf::from("/nonexistent/launcher"),
            ..EngineConfig::default()
        };
        let err = ServiceLaunch.plan(&spec, &config).await.expect_err("fail");
        assert!(matches!(err, EngineError::LaunchFailed(_)), "got {err:?}");
    }

    #[test]
    fn test_parse_launched_pid_from_service_output() {
        assert_eq!(parse_launched_pid("com.example.demo: 4242\n"), Some(4242));
        assert_eq!(parse_launched_pid("launched pid 9\n"), Some(9));
        assert_eq!(parse_launched_pid("no pid here\n"), None);
    }

    #[test]
    fn test_strategy_selection_by_target_type() {
        let exec = TargetSpec::Executable {
            path: PathBuf::from("/bin/true"),
            args: vec![],
        };
        assert_eq!(strategy_for(&exec).name(), "direct-spawn");
        let bundle = TargetSpec::Bundle {
            id: "com.example.demo".to_string(),
        };
        assert_eq!(strategy_for(&bundle).name(), "service-launch");
        assert_eq!(strategy_for(&TargetSpec::Pid(1)).name(), "direct-spawn");
    }

    #[test]
    fn test_target_keys_are_stable() {
        let a = TargetSpec::Bundle {
            id: "com.example.demo".to_string(),
        };
        assert_eq!(a.key(), "bundle:com.example.demo");
        let b = TargetSpec::Executable {
            path: PathBuf::from("/tmp/echo-loop"),
            args: vec!["ignored-by-key".to_string()],
        };
        assert_eq!(b.key(), "exec:/tmp/echo-loop");
    }
}
