//! Local daemon ⇄ coordinator messages

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Messages the daemon sends to its user's coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all = "snake_case")]
pub enum CliInbound {
    /// Reply to a forwarded `rpc_call`. Everything besides `requestId`
    /// (`data`, an `error` object, anything newer) is relayed untouched.
    #[serde(rename_all = "camelCase")]
    RpcResult {
        request_id: String,
        #[serde(flatten)]
        body: Map<String, Value>,
    },

    #[serde(other)]
    Unknown,
}

/// Messages the coordinator forwards to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all = "snake_case")]
pub enum CliOutbound {
    /// The browser's frame with its `requestId` re-asserted.
    #[serde(rename_all = "camelCase")]
    RpcCall {
        request_id: String,
        method: String,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
}
