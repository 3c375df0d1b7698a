//! Tool: run_shell — one-shot shell command with a timeout.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{Tool, ToolResult};

/// Commands that are never run, whatever the model asks.
const DENYLIST: &[&str] = &["rm -rf /", "mkfs", "shutdown", "reboot", ":(){"];

pub struct RunShellTool {
    timeout: Duration,
}

impl Default for RunShellTool {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl Tool for RunShellTool {
    fn name(&self) -> &str {
        "run_shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its stdout and stderr"
    }

    fn long_description(&self) -> String {
        "Execute a shell command via sh -c and return its combined output. \
         Obviously destructive commands are blocked. The command is killed \
         after 60 seconds."
            .to_string()
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute via sh -c."
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory (optional)."
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let command = match input.get("command").and_then(|v| v.as_str()) {
            Some(c) => c,
            None => return ToolResult::error("missing required parameter: command"),
        };

        if DENYLIST.iter().any(|bad| command.contains(bad)) {
            return ToolResult::error("command blocked by safety rules");
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(cwd) = input.get("cwd").and_then(|v| v.as_str()) {
            cmd.current_dir(cwd);
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ToolResult::error(format!("failed to spawn: {e}")),
            Err(_) => {
                return ToolResult::error(format!(
                    "command timed out after {}s",
                    self.timeout.as_secs()
                ))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut result = String::new();
        if !stdout.is_empty() {
            result.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str("[stderr]\n");
            result.push_str(&stderr);
        }
        if let Some(code) = output.status.code() {
            if code != 0 {
                result.push_str(&format!("\n[exit code: {code}]"));
            }
        }
        if result.is_empty() {
            result = "(no output)".to_string();
        }

        if output.status.success() {
            ToolResult::success(result)
        } else {
            ToolResult::error(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_round_trips() {
        let tool = RunShellTool::default();
        let result = tool
            .execute(serde_json::json!({"command": "echo courier"}))
            .await;
        assert!(!result.is_error);
        assert_eq!(result.content.trim(), "courier");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error_result() {
        let tool = RunShellTool::default();
        let result = tool.execute(serde_json::json!({"command": "false"})).await;
        assert!(result.is_error);
        assert!(result.content.contains("exit code"));
    }

    #[tokio::test]
    async fn denylisted_command_is_blocked() {
        let tool = RunShellTool::default();
        let result = tool
            .execute(serde_json::json!({"command": "rm -rf / --no-preserve-root"}))
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("blocked"));
    }
}
