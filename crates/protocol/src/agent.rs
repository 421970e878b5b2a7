//! Dispatcher ⇄ local agent messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Requests dispatched to a user's agent socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Execute a coding tool on the user's machine.
    #[serde(rename_all = "camelCase")]
    ToolCall {
        id: String,
        tool: String,
        args: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_cwd: Option<String>,
    },

    /// Lightweight daemon RPC (snapshots, codex tokens).
    RpcCall {
        id: String,
        method: String,
        args: Value,
    },
}

impl AgentRequest {
    /// Correlation id of this request.
    pub fn id(&self) -> &str {
        match self {
            AgentRequest::ToolCall { id, .. } | AgentRequest::RpcCall { id, .. } => id,
        }
    }

    /// Tool or method name, for logging.
    pub fn name(&self) -> &str {
        match self {
            AgentRequest::ToolCall { tool, .. } => tool,
            AgentRequest::RpcCall { method, .. } => method,
        }
    }

    pub fn rpc(method: impl Into<String>, args: Value) -> Self {
        AgentRequest::RpcCall {
            id: crate::new_id(),
            method: method.into(),
            args,
        }
    }
}

/// Messages the agent sends back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentInbound {
    #[serde(rename_all = "camelCase")]
    ToolResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        /// Older agents echo the request id here instead of `callId`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },

    #[serde(other)]
    Other,
}

/// Human-readable message for an `error` field that may be a string, an
/// object with a `message`, or anything else.
pub fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("message") {
            Some(Value::String(s)) => s.clone(),
            _ => error.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_call_serializes_project_fields_in_camel_case() {
        let value = serde_json::to_value(AgentRequest::ToolCall {
            id: "t1".to_string(),
            tool: "readFile".to_string(),
            args: json!({"path": "src/main.rs"}),
            project_id: Some("p1".to_string()),
            project_cwd: Some("/home/dev/app".to_string()),
        })
        .expect("serialize");

        assert_eq!(
            value,
            json!({
                "type": "tool_call",
                "id": "t1",
                "tool": "readFile",
                "args": {"path": "src/main.rs"},
                "projectId": "p1",
                "projectCwd": "/home/dev/app"
            })
        );
    }

    #[test]
    fn tool_result_accepts_call_id_or_legacy_id() {
        let modern: AgentInbound = serde_json::from_value(json!({
            "type": "tool_result", "callId": "t2", "result": {"ok": true}
        }))
        .expect("parse");
        let legacy: AgentInbound = serde_json::from_value(json!({
            "type": "tool_result", "id": "t3", "error": "boom"
        }))
        .expect("parse");

        match modern {
            AgentInbound::ToolResult { call_id, id, result, error } => {
                assert_eq!(call_id.as_deref(), Some("t2"));
                assert_eq!(id, None);
                assert_eq!(result, Some(json!({"ok": true})));
                assert_eq!(error, None);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
        match legacy {
            AgentInbound::ToolResult { call_id, id, .. } => {
                assert_eq!(call_id, None);
                assert_eq!(id.as_deref(), Some("t3"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn non_result_agent_messages_are_other() {
        let msg: AgentInbound =
            serde_json::from_str(r#"{"type":"log","line":"hello"}"#).expect("parse");
        assert_eq!(msg, AgentInbound::Other);
    }

    #[test]
    fn error_message_handles_common_shapes() {
        assert_eq!(error_message(&json!("denied")), "denied");
        assert_eq!(
            error_message(&json!({"message": "path escapes project"})),
            "path escapes project"
        );
        assert_eq!(error_message(&json!({"code": 7})), r#"{"code":7}"#);
    }
}
