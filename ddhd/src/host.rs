//! Host management commands issued by the monitor.
//!
//! [`HostCommandInterface`] is the only write path from the daemon into the
//! storage stack. [`CommandHost`] implements it by running argv templates
//! configured in the daemon config file.

use async_trait::async_trait;
use ddh_common::{DeviceId, EvacuationEvent, ReclaimState, Tier};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default upper bound for one host command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Output kept in error messages.
const MAX_OUTPUT_CHARS: usize = 512;

/// Markers in unmount output meaning the device was not mounted.
const ALREADY_UNMOUNTED_MARKERS: [&str; 2] = ["not mounted", "already unmounted"];

/// Errors from host commands. All are logged by the caller; none is fatal.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{action} timed out after {timeout:?}")]
    Timeout {
        action: &'static str,
        timeout: Duration,
    },

    #[error("{action} failed ({status}): {output}")]
    Failed {
        action: &'static str,
        status: String,
        output: String,
    },

    #[error("device {device} is already unmounted")]
    AlreadyUnmounted { device: DeviceId },

    #[error("invalid {action} command template: {detail}")]
    Template {
        action: &'static str,
        detail: String,
    },
}

/// Mount, unmount, evacuate and reclaim controls of the storage stack.
#[async_trait]
pub trait HostCommandInterface: Send + Sync {
    /// Mount a caching device (whole disk group) or a capacity device.
    async fn mount(&self, device: &DeviceId, tier: Tier) -> Result<(), CommandError>;

    async fn unmount(&self, device: &DeviceId, tier: Tier) -> Result<(), CommandError>;

    /// Raise an evacuation event on the device.
    async fn evacuate(&self, device: &DeviceId, event: EvacuationEvent)
    -> Result<(), CommandError>;

    async fn set_reclaim_state(&self, state: ReclaimState) -> Result<(), CommandError>;

    /// Clear the accumulated latency statistics of a device.
    async fn reset_latency_stats(&self, device: &DeviceId) -> Result<(), CommandError>;
}

/// Argv templates for each host action.
///
/// Placeholders: `{device}`, `{tier}`, `{event}` (numeric event code),
/// `{state}` (numeric reclaim state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandTemplates {
    pub mount: Vec<String>,
    pub unmount: Vec<String>,
    pub evacuate: Vec<String>,
    pub set_reclaim_state: Vec<String>,
    pub reset_latency_stats: Vec<String>,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            mount: argv(&["ddh-hostctl", "mount", "--tier", "{tier}", "{device}"]),
            unmount: argv(&["ddh-hostctl", "unmount", "--tier", "{tier}", "{device}"]),
            evacuate: argv(&["ddh-hostctl", "evacuate", "--event", "{event}", "{device}"]),
            set_reclaim_state: argv(&["ddh-hostctl", "reclaim", "--state", "{state}"]),
            reset_latency_stats: argv(&["ddh-hostctl", "reset-latency", "{device}"]),
        }
    }
}

/// Substitute `{name}` placeholders in every argument.
fn render(
    action: &'static str,
    template: &[String],
    vars: &[(&str, String)],
) -> Result<Vec<String>, CommandError> {
    if template.is_empty() {
        return Err(CommandError::Template {
            action,
            detail: "no program configured".to_string(),
        });
    }
    let rendered: Vec<String> = template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect();
    if let Some(unresolved) = rendered.iter().find(|arg| arg.contains('{') && arg.contains('}')) {
        return Err(CommandError::Template {
            action,
            detail: format!("unresolved placeholder in {unresolved:?}"),
        });
    }
    Ok(rendered)
}

/// [`HostCommandInterface`] running configured command templates.
#[derive(Debug, Clone)]
pub struct CommandHost {
    templates: CommandTemplates,
    timeout: Duration,
}

impl CommandHost {
    pub fn new(templates: CommandTemplates, timeout: Duration) -> Self {
        Self { templates, timeout }
    }

    async fn run(&self, action: &'static str, argv: Vec<String>) -> Result<String, CommandError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(CommandError::Template {
                action,
                detail: "no program configured".to_string(),
            });
        };

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| CommandError::Timeout {
                action,
                timeout: self.timeout,
            })?
            .map_err(|source| CommandError::Spawn {
                program: program.clone(),
                source,
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr.trim());
        }

        if !output.status.success() {
            return Err(CommandError::Failed {
                action,
                status: output.status.to_string(),
                output: text.chars().take(MAX_OUTPUT_CHARS).collect(),
            });
        }

        debug!(action, program = %program, "Host command completed");
        Ok(text)
    }
}

fn device_vars(device: &DeviceId, tier: Tier) -> Vec<(&'static str, String)> {
    vec![("device", device.to_string()), ("tier", tier.to_string())]
}

#[async_trait]
impl HostCommandInterface for CommandHost {
    async fn mount(&self, device: &DeviceId, tier: Tier) -> Result<(), CommandError> {
        let argv = render("mount", &self.templates.mount, &device_vars(device, tier))?;
        self.run("mount", argv).await.map(|_| ())
    }

    async fn unmount(&self, device: &DeviceId, tier: Tier) -> Result<(), CommandError> {
        let argv = render("unmount", &self.templates.unmount, &device_vars(device, tier))?;
        match self.run("unmount", argv).await {
            Err(CommandError::Failed { output, .. })
                if ALREADY_UNMOUNTED_MARKERS
                    .iter()
                    .any(|marker| output.to_lowercase().contains(marker)) =>
            {
                Err(CommandError::AlreadyUnmounted {
                    device: device.clone(),
                })
            }
            other => other.map(|_| ()),
        }
    }

    async fn evacuate(
        &self,
        device: &DeviceId,
        event: EvacuationEvent,
    ) -> Result<(), CommandError> {
        let vars = [
            ("device", device.to_string()),
            ("event", event.code().to_string()),
        ];
        let argv = render("evacuate", &self.templates.evacuate, &vars)?;
        self.run("evacuate", argv).await.map(|_| ())
    }

    async fn set_reclaim_state(&self, state: ReclaimState) -> Result<(), CommandError> {
        let vars = [("state", state.as_raw().to_string())];
        let argv = render("set_reclaim_state", &self.templates.set_reclaim_state, &vars)?;
        self.run("set_reclaim_state", argv).await.map(|_| ())
    }

    async fn reset_latency_stats(&self, device: &DeviceId) -> Result<(), CommandError> {
        let vars = [("device", device.to_string())];
        let argv = render(
            "reset_latency_stats",
            &self.templates.reset_latency_stats,
            &vars,
        )?;
        self.run("reset_latency_stats", argv).await.map(|_| ())
    }
}
