use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::routing::ApplyEffect;

/// Raft node identifier type for this project.
pub type NodeId = u64;

/// Raft node metadata stored in membership config and exposed to networking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// A human-friendly node name (optional).
    pub name: String,

    /// The control API base URL. Followers report it so clients can redirect writes.
    pub api_base_url: String,

    /// Base URL serving `/raft/*` RPCs. Usually the same listener as `api_base_url`.
    pub raft_endpoint: String,
}

/// Opaque command bytes carried by a log entry.
///
/// The log never interprets these; only `RouteFsm` decodes them. On the wire (raft RPC bodies and
/// the persisted log) they are base64 text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload(#[serde(with = "base64_bytes")] Vec<u8>);

impl CommandPayload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// State-machine response to a committed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClientResponse {
    Ok { effect: ApplyEffect },
    /// The entry was committed but the state machine refused it.
    Rejected { code: String, message: String },
}

/// OpenRaft type configuration for this project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TypeConfig;

impl openraft::RaftTypeConfig for TypeConfig {
    type D = CommandPayload;
    type R = ClientResponse;

    type NodeId = NodeId;
    type Node = NodeMeta;

    type Entry = openraft::impls::Entry<TypeConfig>;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
    type AsyncRuntime = openraft::impls::TokioRuntime;

    // Requires tokio `io-util` feature for AsyncRead/Write/Seek impls on Cursor.
    type SnapshotData = Cursor<Vec<u8>>;
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
