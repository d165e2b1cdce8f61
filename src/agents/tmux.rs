//! tmux Terminal Client
//!
//! Drives a tmux server through its command-line interface:
//! - `list-panes` for pane enumeration and agent detection
//! - `set-buffer` + `paste-buffer` for multi-line prompt delivery
//! - `capture-pane` for reading agent output

use async_trait::async_trait;
use log::{debug, warn};
use tokio::process::Command;
use uuid::Uuid;

use super::{AgentError, Pane, TerminalClient};
use crate::workflow::normalize_agent_type;

/// Agent types recognised in pane titles and commands.
const KNOWN_AGENTS: &[&str] = &["claude", "codex", "gemini"];

/// Format string for `list-panes -F`, tab separated.
const PANE_FORMAT: &str = "#{pane_id}\t#{pane_index}\t#{pane_title}\t#{pane_current_command}";

/// Prefix of the buffers used to stage prompts.
const BUFFER_PREFIX: &str = "paneflow";

/// Terminal client backed by the `tmux` binary.
#[derive(Debug, Clone)]
pub struct TmuxClient {
    binary: String,
}

impl TmuxClient {
    /// Creates a client using `tmux` from `PATH`.
    pub fn new() -> Self {
        Self::with_binary("tmux")
    }

    /// Creates a client using a specific tmux binary.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, AgentError> {
        debug!("{} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary).args(args).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(AgentError::Command {
                command: format!("tmux {}", args.first().copied().unwrap_or_default()),
                message: if stderr.is_empty() {
                    format!("exit status {}", output.status)
                } else {
                    stderr
                },
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for TmuxClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalClient for TmuxClient {
    async fn list_panes(&self, session: &str) -> Result<Vec<Pane>, AgentError> {
        let stdout = self
            .run(&["list-panes", "-s", "-t", session, "-F", PANE_FORMAT])
            .await?;
        Ok(stdout.lines().filter_map(parse_pane_line).collect())
    }

    async fn send(&self, pane_id: &str, text: &str, with_enter: bool) -> Result<(), AgentError> {
        // One buffer per delivery; concurrent sends must not share one.
        let buffer = buffer_name(pane_id);
        self.run(&["set-buffer", "-b", &buffer, "--", text]).await?;
        if let Err(e) = self
            .run(&["paste-buffer", "-d", "-p", "-b", &buffer, "-t", pane_id])
            .await
        {
            if let Err(cleanup) = self.run(&["delete-buffer", "-b", &buffer]).await {
                warn!("Could not delete buffer {}: {}", buffer, cleanup);
            }
            return Err(e);
        }
        if with_enter {
            self.run(&["send-keys", "-t", pane_id, "Enter"]).await?;
        }
        Ok(())
    }

    async fn capture_output(&self, pane_id: &str, max_lines: usize) -> Result<String, AgentError> {
        let start = format!("-{}", max_lines);
        self.run(&["capture-pane", "-p", "-J", "-t", pane_id, "-S", &start])
            .await
    }
}

/// Unique staging buffer name for a prompt sent to `pane_id`.
fn buffer_name(pane_id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        BUFFER_PREFIX,
        pane_id.trim_start_matches('%'),
        &suffix[..12]
    )
}

/// Parses one line of `list-panes` output produced with [`PANE_FORMAT`].
pub fn parse_pane_line(line: &str) -> Option<Pane> {
    let mut fields = line.split('\t');
    let id = fields.next()?.trim();
    let index = fields.next()?.trim().parse().ok()?;
    let title = fields.next().unwrap_or_default().to_string();
    let command = fields.next().unwrap_or_default().to_string();

    if id.is_empty() {
        return None;
    }

    let agent_type = infer_agent_type(&title, &command);
    Some(Pane {
        id: id.to_string(),
        index,
        title,
        command,
        agent_type,
    })
}

/// Guesses the agent type from a pane's title or foreground command.
///
/// Titles like `project__cc_1` or `claude-code` both resolve to `claude`.
pub fn infer_agent_type(title: &str, command: &str) -> Option<String> {
    [title, command]
        .iter()
        .flat_map(|text| text.split(|c: char| !c.is_ascii_alphanumeric()))
        .filter(|token| !token.is_empty())
        .map(normalize_agent_type)
        .find(|agent| KNOWN_AGENTS.contains(&agent.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pane_line() {
        let pane = parse_pane_line("%3\t2\tproj__cod_1\tnode").unwrap();
        assert_eq!(pane.id, "%3");
        assert_eq!(pane.index, 2);
        assert_eq!(pane.agent_type.as_deref(), Some("codex"));
    }

    #[test]
    fn test_parse_pane_line_rejects_garbage() {
        assert!(parse_pane_line("").is_none());
        assert!(parse_pane_line("%1\tnot-a-number\tt\tc").is_none());
    }

    #[test]
    fn test_infer_agent_type() {
        assert_eq!(infer_agent_type("claude-code", "node").as_deref(), Some("claude"));
        assert_eq!(infer_agent_type("shell", "gemini").as_deref(), Some("gemini"));
        assert_eq!(infer_agent_type("proj__cc_2", "node").as_deref(), Some("claude"));
        assert_eq!(infer_agent_type("bash", "zsh"), None);
    }

    #[test]
    fn test_buffer_names_are_unique() {
        let first = buffer_name("%4");
        let second = buffer_name("%4");
        assert!(first.starts_with("paneflow-4-"));
        assert_ne!(first, second);
    }

    /// Writes a stand-in tmux that appends its arguments to `log`.
    #[cfg(unix)]
    fn scripted_tmux(dir: &std::path::Path, log: &std::path::Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("tmux");
        let body = format!("#!/bin/sh\necho \"$*\" >> '{}'\n", log.display());
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_sends_use_separate_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let client = TmuxClient::with_binary(scripted_tmux(dir.path(), &log).display().to_string());

        let sends: Vec<_> = ["%1", "%2", "%3"]
            .into_iter()
            .map(|pane| {
                let client = client.clone();
                tokio::spawn(async move { client.send(pane, &format!("prompt for {}", pane), true).await })
            })
            .collect();
        for send in sends {
            send.await.unwrap().unwrap();
        }

        let calls = std::fs::read_to_string(&log).unwrap();
        let mut staged = std::collections::HashMap::new();
        let mut pasted = Vec::new();
        for line in calls.lines() {
            let args: Vec<&str> = line.split(' ').collect();
            match args[0] {
                "set-buffer" => {
                    let pane = args.last().unwrap();
                    assert!(staged.insert(args[2].to_string(), pane.to_string()).is_none());
                }
                "paste-buffer" => pasted.push((args[4].to_string(), args[6].to_string())),
                _ => {}
            }
        }

        assert_eq!(staged.len(), 3);
        assert_eq!(pasted.len(), 3);
        for (buffer, pane) in pasted {
            assert_eq!(staged[&buffer], pane);
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let client = TmuxClient::with_binary("/nonexistent/tmux-binary");
        let err = client.list_panes("main").await.unwrap_err();
        assert!(matches!(err, AgentError::Io(_)));
    }
}
