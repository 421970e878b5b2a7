//! Browser tab ⇄ coordinator messages

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{CliStatus, RpcErrorKind};

/// Messages a browser tab sends to its user's coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all = "snake_case")]
pub enum FrontendInbound {
    /// Poll whether the daemon is connected.
    CliStatusRequest,

    /// Invoke a daemon-side method through the coordinator. `body` holds
    /// `input` and any other field, forwarded to the daemon as sent.
    #[serde(rename_all = "camelCase")]
    RpcCall {
        request_id: String,
        method: String,
        #[serde(flatten)]
        body: Map<String, Value>,
    },

    /// Tags this server does not know yet.
    #[serde(other)]
    Unknown,
}

/// Messages the coordinator sends to a browser tab
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all = "snake_case")]
pub enum FrontendOutbound {
    CliStatusResponse {
        connected: bool,
    },

    CliStatus {
        status: CliStatus,
        /// Unix milliseconds
        timestamp: u64,
    },

    /// The daemon's `rpc_result`, fields relayed verbatim.
    #[serde(rename_all = "camelCase")]
    RpcResult {
        request_id: String,
        #[serde(flatten)]
        body: Map<String, Value>,
    },

    #[serde(rename_all = "camelCase")]
    RpcError {
        request_id: String,
        #[serde(rename = "type")]
        kind: RpcErrorKind,
        message: String,
    },
}
