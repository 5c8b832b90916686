//! The subset of the remote execution API that the gateway needs to understand.
//!
//! Every message keeps the members the gateway does not interpret in `other`, so that they are
//! forwarded between clients and backends unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorBody;

/// The digest of a blob in the content addressable storage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub hash: String,
    #[serde(default)]
    pub size_bytes: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetCapabilitiesRequest {
    #[serde(default)]
    pub instance_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub instance_name: String,
    pub action_digest: Digest,
    #[serde(default)]
    pub skip_cache_lookup: bool,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitExecutionRequest {
    pub name: String,
}

/// A long running execution, as streamed back by `execute` and `wait_execution`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Operation {
    pub fn new(name: impl Into<String>, done: bool) -> Self {
        Self {
            name: name.into(),
            done,
            other: Map::new(),
        }
    }
}

/// A single line of a newline delimited JSON stream of operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFrame {
    Operation(Operation),
    /// The stream failed. No frames follow an error.
    Error(ErrorBody),
}
