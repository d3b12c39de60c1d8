//! LLM invoker: the interface the coder-reviewer loop calls against,
//! plus a subprocess-based reference implementation that spawns an agent
//! CLI, streams its NDJSON stdout, and extracts the final result into the
//! `AgentSpec`/`InvocationOutcome` shape the rest of the crate uses.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum InvokerError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("agent process exited with code {0:?}")]
    NonZeroExit(Option<i32>),
    #[error("io error talking to agent process: {0}")]
    Io(#[source] std::io::Error),
}

/// Role, model, and budget for a single invocation. `allowed_tools` lets
/// the inner fix loop restrict the coder to read/edit/write/glob
/// without a shell.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub role: String,
    pub system_prompt: String,
    pub model: String,
    pub max_budget_usd: f64,
    pub allowed_tools: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub result_text: String,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub session_id: Option<String>,
}

#[async_trait]
pub trait LlmInvoker: Send + Sync {
    async fn invoke(
        &self,
        agent: &AgentSpec,
        user_prompt: &str,
        work_dir: &Path,
    ) -> Result<InvocationOutcome, InvokerError>;
}

/// Stream-json line shapes the reference CLI emits. Implementing any
/// *specific* vendor's wire protocol beyond this is out of scope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    Assistant { message: AssistantMessage },
    Result {
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        session_id: Option<String>,
    },
    User {},
    System {},
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Spawns `claude_cmd` as a subprocess, writes the prompt to stdin, and
/// streams stdout as newline-delimited JSON, matching the corpus's
/// `ClaudeRunner::run_iteration` shape.
pub struct SubprocessInvoker {
    claude_cmd: String,
    extra_args: Vec<String>,
}

impl SubprocessInvoker {
    pub fn new(claude_cmd: impl Into<String>) -> Self {
        Self {
            claude_cmd: claude_cmd.into(),
            extra_args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

#[async_trait]
impl LlmInvoker for SubprocessInvoker {
    async fn invoke(
        &self,
        agent: &AgentSpec,
        user_prompt: &str,
        work_dir: &Path,
    ) -> Result<InvocationOutcome, InvokerError> {
        let start = Instant::now();

        let log_dir = work_dir.join(".nebula-logs");
        tokio::fs::create_dir_all(&log_dir)
            .await
            .map_err(InvokerError::Io)?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let prompt_file = log_dir.join(format!("{}-{stamp}-prompt.md", agent.role));
        tokio::fs::write(&prompt_file, user_prompt)
            .await
            .map_err(InvokerError::Io)?;

        let mut cmd = Command::new(&self.claude_cmd);
        cmd.arg("--system-prompt").arg(&agent.system_prompt);
        cmd.arg("--model").arg(&agent.model);
        if !agent.allowed_tools.is_empty() {
            cmd.arg("--allowed-tools").arg(agent.allowed_tools.join(","));
        }
        for arg in &self.extra_args {
            cmd.arg(arg);
        }

        let mut child = cmd
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .current_dir(work_dir)
            .spawn()
            .map_err(InvokerError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(user_prompt.as_bytes())
                .await
                .map_err(InvokerError::Io)?;
            stdin.shutdown().await.map_err(InvokerError::Io)?;
        }

        let stdout = child.stdout.take().expect("piped stdout");
        let mut reader = BufReader::new(stdout).lines();

        let mut accumulated_text = String::new();
        let mut final_result: Option<String> = None;
        let mut cost_usd = 0.0;
        let mut session_id = None;

        while let Some(line) = reader.next_line().await.map_err(InvokerError::Io)? {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamEvent>(&line) {
                Ok(StreamEvent::Assistant { message }) => {
                    for block in message.content {
                        if let ContentBlock::Text { text } = block {
                            accumulated_text.push_str(&text);
                            accumulated_text.push('\n');
                        }
                    }
                }
                Ok(StreamEvent::Result {
                    result,
                    total_cost_usd,
                    session_id: sid,
                    ..
                }) => {
                    final_result = result;
                    cost_usd = total_cost_usd.unwrap_or(0.0);
                    session_id = sid;
                }
                Ok(StreamEvent::User {}) | Ok(StreamEvent::System {}) => {}
                Err(_) => {
                    accumulated_text.push_str(&line);
                    accumulated_text.push('\n');
                }
            }
        }

        let status = child.wait().await.map_err(InvokerError::Io)?;
        if !status.success() {
            return Err(InvokerError::NonZeroExit(status.code()));
        }

        Ok(InvocationOutcome {
            result_text: final_result.unwrap_or(accumulated_text),
            cost_usd,
            duration_ms: start.elapsed().as_millis() as u64,
            session_id,
        })
    }
}

/// An in-process invoker for tests and for callers that don't want to spawn
/// a real subprocess.
pub struct FnInvoker<F>(pub F)
where
    F: Fn(&AgentSpec, &str) -> Result<InvocationOutcome, InvokerError> + Send + Sync;

#[async_trait]
impl<F> LlmInvoker for FnInvoker<F>
where
    F: Fn(&AgentSpec, &str) -> Result<InvocationOutcome, InvokerError> + Send + Sync,
{
    async fn invoke(
        &self,
        agent: &AgentSpec,
        user_prompt: &str,
        _work_dir: &Path,
    ) -> Result<InvocationOutcome, InvokerError> {
        (self.0)(agent, user_prompt)
    }
}

pub fn read_prompt_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec() -> AgentSpec {
        AgentSpec {
            role: "coder".to_string(),
            system_prompt: "be a coder".to_string(),
            model: "default".to_string(),
            max_budget_usd: 10.0,
            allowed_tools: vec![],
        }
    }

    #[tokio::test]
    async fn fn_invoker_returns_configured_outcome() {
        let invoker = FnInvoker(|_agent, prompt| {
            Ok(InvocationOutcome {
                result_text: format!("echo: {prompt}"),
                cost_usd: 0.5,
                duration_ms: 10,
                session_id: Some("s-1".to_string()),
            })
        });
        let dir = tempdir().unwrap();
        let outcome = invoker.invoke(&spec(), "do the thing", dir.path()).await.unwrap();
        assert_eq!(outcome.result_text, "echo: do the thing");
        assert_eq!(outcome.cost_usd, 0.5);
    }

    #[test]
    fn stream_event_parses_assistant_text_block() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#;
        let event: StreamEvent = serde_json::from_str(line).unwrap();
        match event {
            StreamEvent::Assistant { message } => {
                assert_eq!(message.content.len(), 1);
            }
            _ => panic!("expected assistant event"),
        }
    }

    #[test]
    fn stream_event_parses_result_with_cost() {
        let line = r#"{"type":"result","result":"done","is_error":false,"total_cost_usd":1.25,"session_id":"abc"}"#;
        let event: StreamEvent = serde_json::from_str(line).unwrap();
        match event {
            StreamEvent::Result { result, total_cost_usd, session_id, .. } => {
                assert_eq!(result.as_deref(), Some("done"));
                assert_eq!(total_cost_usd, Some(1.25));
                assert_eq!(session_id.as_deref(), Some("abc"));
            }
            _ => panic!("expected result event"),
        }
    }
}
