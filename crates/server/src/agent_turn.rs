//! The tool-using model turn behind `POST /api/v1/agent-proxy`.
//!
//! The model decides which tools to run; each tool runs on the user's
//! machine through the session's agent socket. Everything the turn produces
//! is pushed to a resumable stream record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use toolrelay_protocol::{AgentRequest, StreamChunk};

use crate::chat_store::{Chat, ChatMessage};
use crate::session_actor::UserSessionHandle;
use crate::stream_store::StreamRecord;

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Outcomes of every tool call made so far in this turn, in order.
    pub tool_results: Vec<ToolOutcome>,
    pub plan_mode: bool,
    pub step: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ModelStep {
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
}

#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool: String,
    pub args: Value,
}

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub id: String,
    pub tool: String,
    pub result: Result<Value, String>,
}

/// Language model collaborator. One call per step of a turn.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn next_step(&self, request: &ModelRequest) -> anyhow::Result<ModelStep>;
}

/// Stand-in model shipped with the binary.
///
/// Echoes the latest user message. A message of the form
/// `!<tool> <json args>` runs that tool once and reports its result.
pub struct EchoModel;

#[async_trait]
impl ModelClient for EchoModel {
    async fn next_step(&self, request: &ModelRequest) -> anyhow::Result<ModelStep> {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == crate::chat_store::MessageRole::User)
            .map(|m| m.content.trim())
            .unwrap_or_default();

        if let Some(outcome) = request.tool_results.last() {
            let text = match &outcome.result {
                Ok(value) => format!("{} returned {value}", outcome.tool),
                Err(message) => format!("{} failed: {message}", outcome.tool),
            };
            return Ok(ModelStep {
                text,
                tool_calls: Vec::new(),
            });
        }

        if let Some(command) = prompt.strip_prefix('!') {
            let (tool, args) = command.split_once(' ').unwrap_or((command, "{}"));
            let args = serde_json::from_str(args).unwrap_or_else(|_| json!({ "input": args }));
            return Ok(ModelStep {
                text: String::new(),
                tool_calls: vec![ToolInvocation {
                    tool: tool.to_string(),
                    args,
                }],
            });
        }

        Ok(ModelStep {
            text: prompt.to_string(),
            tool_calls: Vec::new(),
        })
    }
}

pub struct TurnContext {
    pub session: UserSessionHandle,
    pub chat: Chat,
    pub model: String,
    pub plan_mode: bool,
    pub tool_timeout: Duration,
    pub max_steps: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Assistant text produced across all steps.
    pub text: String,
    /// Tool calls dispatched to the agent.
    pub tool_calls: usize,
    /// Stopped early because the agent went away or the model failed.
    pub aborted: bool,
}

/// Run model steps until one produces no tool calls, the step limit is
/// hit, or the agent becomes unavailable. Always ends the stream with
/// `done`.
pub async fn run_turn(
    ctx: TurnContext,
    model: Arc<dyn ModelClient>,
    messages: Vec<ChatMessage>,
    record: Arc<StreamRecord>,
) -> TurnOutcome {
    let mut request = ModelRequest {
        model: ctx.model.clone(),
        messages,
        tool_results: Vec::new(),
        plan_mode: ctx.plan_mode,
        step: 0,
    };
    let mut outcome = TurnOutcome {
        text: String::new(),
        tool_calls: 0,
        aborted: false,
    };

    'steps: while request.step < ctx.max_steps {
        let step = match model.next_step(&request).await {
            Ok(step) => step,
            Err(e) => {
                warn!(
                    component = "agent_turn",
                    event = "turn.model_failed",
                    user_id = %ctx.session.user_id,
                    chat_id = %ctx.chat.id,
                    error = %e,
                );
                record.push(&StreamChunk::Error {
                    code: "model_error".to_string(),
                    message: e.to_string(),
                });
                outcome.aborted = true;
                break;
            }
        };
        request.step += 1;

        if !step.text.is_empty() {
            record.push(&StreamChunk::Text {
                text: step.text.clone(),
            });
            outcome.text.push_str(&step.text);
        }
        if step.tool_calls.is_empty() {
            break;
        }

        for invocation in step.tool_calls {
            let id = toolrelay_protocol::new_id();
            record.push(&StreamChunk::ToolCall {
                id: id.clone(),
                tool: invocation.tool.clone(),
                args: invocation.args.clone(),
            });
            outcome.tool_calls += 1;

            let result = ctx
                .session
                .dispatch(
                    AgentRequest::ToolCall {
                        id: id.clone(),
                        tool: invocation.tool.clone(),
                        args: invocation.args,
                        project_id: Some(ctx.chat.project_id.clone()),
                        project_cwd: Some(ctx.chat.project_cwd.clone()),
                    },
                    ctx.tool_timeout,
                )
                .await;

            match &result {
                Ok(value) => record.push(&StreamChunk::ToolResult {
                    id: id.clone(),
                    result: Some(value.clone()),
                    error: None,
                }),
                Err(e) => {
                    record.push(&StreamChunk::ToolResult {
                        id: id.clone(),
                        result: None,
                        error: Some(e.to_string()),
                    });
                    if e.is_agent_unavailable() {
                        record.push(&StreamChunk::Error {
                            code: e.code().to_string(),
                            message: e.to_string(),
                        });
                        outcome.aborted = true;
                        break 'steps;
                    }
                }
            }

            request.tool_results.push(ToolOutcome {
                id,
                tool: invocation.tool,
                result: result.map_err(|e| e.to_string()),
            });
        }
    }

    if request.step >= ctx.max_steps && !outcome.aborted {
        info!(
            component = "agent_turn",
            event = "turn.step_limit",
            user_id = %ctx.session.user_id,
            chat_id = %ctx.chat.id,
            steps = request.step,
        );
    }

    record.push(&StreamChunk::Done);
    record.complete();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, OutboundMessage};
    use crate::session_command::SessionCommand;
    use crate::stream_store::StreamStore;
    use futures::StreamExt;
    use tokio::sync::{mpsc, Mutex};
    use toolrelay_protocol::{AgentInbound, Role};

    /// Returns queued steps in order, then an empty step.
    struct ScriptedModel {
        steps: Mutex<Vec<ModelStep>>,
        seen_results: Mutex<Vec<usize>>,
    }

    impl ScriptedModel {
        fn new(mut steps: Vec<ModelStep>) -> Arc<Self> {
            steps.reverse();
            Arc::new(Self {
                steps: Mutex::new(steps),
                seen_results: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn next_step(&self, request: &ModelRequest) -> anyhow::Result<ModelStep> {
            self.seen_results
                .lock()
                .await
                .push(request.tool_results.len());
            Ok(self.steps.lock().await.pop().unwrap_or_default())
        }
    }

    fn chat() -> Chat {
        Chat {
            id: "chat-1".into(),
            user_id: "u1".into(),
            project_id: "p1".into(),
            project_cwd: "/work/p1".into(),
        }
    }

    fn ctx(session: UserSessionHandle, max_steps: usize) -> TurnContext {
        TurnContext {
            session,
            chat: chat(),
            model: "test".into(),
            plan_mode: false,
            tool_timeout: Duration::from_secs(5),
            max_steps,
        }
    }

    fn tool_step(tool: &str) -> ModelStep {
        ModelStep {
            text: String::new(),
            tool_calls: vec![ToolInvocation {
                tool: tool.into(),
                args: json!({ "path": "src/main.rs" }),
            }],
        }
    }

    async fn chunk_types(record: &StreamRecord) -> Vec<String> {
        record
            .attach()
            .map(|data| {
                let value: Value = serde_json::from_str(&data).unwrap();
                value["type"].as_str().unwrap().to_string()
            })
            .collect()
            .await
    }

    /// Answers every tool call on `rx` with `{"ok": tool}`.
    fn spawn_agent(session: UserSessionHandle, mut rx: mpsc::Receiver<OutboundMessage>, connection_id: u64) {
        tokio::spawn(async move {
            while let Some(OutboundMessage::Text(text)) = rx.recv().await {
                let request: AgentRequest = serde_json::from_str(&text).unwrap();
                session
                    .send(SessionCommand::AgentMessage {
                        connection_id,
                        message: AgentInbound::ToolResult {
                            call_id: Some(request.id().to_string()),
                            id: None,
                            result: Some(json!({ "ok": request.name() })),
                            error: None,
                        },
                    })
                    .await;
            }
        });
    }

    #[tokio::test]
    async fn tool_results_feed_the_next_step() {
        let session = UserSessionHandle::spawn("u1".into());
        let (tx, rx) = mpsc::channel(16);
        let agent = Connection::new(Role::Agent, "u1".into(), tx);
        let agent_id = agent.id;
        session.send(SessionCommand::Connect { connection: agent }).await;
        spawn_agent(session.clone(), rx, agent_id);

        let model = ScriptedModel::new(vec![
            tool_step("read_file"),
            ModelStep {
                text: "done reading".into(),
                tool_calls: Vec::new(),
            },
        ]);
        let record = StreamStore::new().begin("chat-1");

        let outcome = run_turn(
            ctx(session, 10),
            model.clone(),
            vec![ChatMessage::user("read it")],
            record.clone(),
        )
        .await;

        assert_eq!(
            outcome,
            TurnOutcome {
                text: "done reading".into(),
                tool_calls: 1,
                aborted: false,
            }
        );
        assert_eq!(*model.seen_results.lock().await, vec![0, 1]);
        assert_eq!(
            chunk_types(&record).await,
            vec!["tool_call", "tool_result", "text", "done"]
        );
    }

    #[tokio::test]
    async fn missing_agent_aborts_the_turn() {
        let session = UserSessionHandle::spawn("u1".into());
        let model = ScriptedModel::new(vec![tool_step("read_file"), tool_step("write_file")]);
        let record = StreamStore::new().begin("chat-1");

        let outcome = run_turn(ctx(session, 10), model.clone(), Vec::new(), record.clone()).await;

        assert!(outcome.aborted);
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(model.seen_results.lock().await.len(), 1);
        assert_eq!(
            chunk_types(&record).await,
            vec!["tool_call", "tool_result", "error", "done"]
        );
    }

    #[tokio::test]
    async fn step_limit_bounds_the_loop() {
        let session = UserSessionHandle::spawn("u1".into());
        let (tx, rx) = mpsc::channel(16);
        let agent = Connection::new(Role::Agent, "u1".into(), tx);
        let agent_id = agent.id;
        session.send(SessionCommand::Connect { connection: agent }).await;
        spawn_agent(session.clone(), rx, agent_id);

        let model = ScriptedModel::new(vec![tool_step("a"), tool_step("b"), tool_step("c")]);
        let record = StreamStore::new().begin("chat-1");

        let outcome = run_turn(ctx(session, 2), model, Vec::new(), record).await;
        assert_eq!(outcome.tool_calls, 2);
        assert!(!outcome.aborted);
    }

    #[tokio::test]
    async fn echo_model_runs_bang_commands_as_tools() {
        let echo = EchoModel;
        let mut request = ModelRequest {
            model: "echo".into(),
            messages: vec![ChatMessage::user(r#"!read_file {"path":"a.txt"}"#)],
            tool_results: Vec::new(),
            plan_mode: false,
            step: 0,
        };

        let step = echo.next_step(&request).await.unwrap();
        assert_eq!(step.tool_calls.len(), 1);
        assert_eq!(step.tool_calls[0].tool, "read_file");
        assert_eq!(step.tool_calls[0].args, json!({ "path": "a.txt" }));

        request.tool_results.push(ToolOutcome {
            id: "t1".into(),
            tool: "read_file".into(),
            result: Ok(json!("hello")),
        });
        let step = echo.next_step(&request).await.unwrap();
        assert!(step.tool_calls.is_empty());
        assert_eq!(step.text, r#"read_file returned "hello""#);
    }
}
