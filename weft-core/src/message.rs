//! Control-message wire types.
//!
//! Messages encode as hierarchical tagged documents: a `type` field
//! naming the event and a `content` subtree whose schema is
//! type-specific. The concrete byte encoding (JSON here, via serde) is a
//! transport concern; the orchestrator core only deals in these typed
//! values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;

/// A (handle, stem) pair naming a data reference resolved by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlePair {
    /// The handle proper.
    pub handle: String,
    /// The stem qualifying the handle.
    pub stem: String,
}

impl HandlePair {
    /// Creates a pair.
    pub fn new(handle: impl Into<String>, stem: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            stem: stem.into(),
        }
    }
}

/// One resource made available to a codelet, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub enum ResourceSpec {
    /// A named, stem-qualified reference resolved by the worker.
    Handle {
        /// The edge name the codelet looks the resource up by.
        name: String,
        /// The (handle, stem) pairs bound to this resource.
        handles: Vec<HandlePair>,
    },
    /// A live TCP byte stream requiring address negotiation.
    Stream {
        /// The negotiation identifier both endpoints present.
        identifier: String,
        /// The edge name the codelet looks the resource up by.
        name: String,
        /// The peer address to connect to, or `None` when this side
        /// expects the incoming connection instead.
        address: Option<SocketAddr>,
        /// Whether the usual connect direction is reversed.
        inverted: bool,
    },
}

impl ResourceSpec {
    /// The edge name the resource was rendered from.
    pub fn name(&self) -> &str {
        match self {
            ResourceSpec::Handle { name, .. } => name,
            ResourceSpec::Stream { name, .. } => name,
        }
    }
}

/// The RESOURCE payload: everything a worker needs to stage one codelet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// The codelet class to instantiate.
    pub codelet: String,
    /// The node's parameter document.
    pub parameters: Value,
    /// Input resources, in edge order.
    pub resource_in: Vec<ResourceSpec>,
    /// Output resources, in edge order.
    pub resource_out: Vec<ResourceSpec>,
}

/// Per-out-edge parameters returned by a completed codelet.
///
/// Applied positionally: entry `i` updates out-edge `i`. Only handle
/// edges currently take parameters; other kinds ignore theirs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeParameters {
    /// Replacement (handle, stem) pairs for a handle edge.
    #[serde(default)]
    pub handles: Vec<HandlePair>,
}

/// A typed control message exchanged between orchestrator and worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Worker announces its listen address and declared domain.
    Address {
        /// Hostname or IP the worker is reachable at.
        host: String,
        /// Port the worker accepts stream connections on.
        port: u16,
        /// The worker's capability domain, possibly empty.
        domain: String,
    },
    /// Orchestrator acknowledges connection establishment.
    Init,
    /// Orchestrator ships resource descriptors for one codelet.
    Resource(ResourceDescriptor),
    /// Worker acknowledges receipt of its resource descriptor.
    ResourceAck,
    /// Orchestrator orders resource acquisition.
    Prepare,
    /// Worker acknowledges successful resource acquisition.
    PrepareAck,
    /// Orchestrator orders codelet execution.
    Execute,
    /// Worker reports successful execution.
    ExecuteAck {
        /// Parameter document for a nested builder, or `Null`.
        #[serde(default)]
        embedding_parameters: Value,
        /// Per-out-edge parameter documents, positional.
        #[serde(default)]
        edge_parameters: Vec<EdgeParameters>,
    },
    /// Either side resets the exchange to a common inactive state.
    Reset {
        /// Human-readable reason.
        message: String,
        /// Rendered cause, for reporting.
        cause: String,
    },
    /// Worker requests orchestrator-held data during execution.
    DataRequest {
        /// Request key of the form `mode:rest`.
        key: String,
        /// Response payload; absent on the request leg.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Vec<u8>>,
    },
    /// Orchestrator orders the worker to shut down.
    Shutdown,
}

impl ControlMessage {
    /// A short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Address { .. } => "address",
            ControlMessage::Init => "init",
            ControlMessage::Resource(_) => "resource",
            ControlMessage::ResourceAck => "resource_ack",
            ControlMessage::Prepare => "prepare",
            ControlMessage::PrepareAck => "prepare_ack",
            ControlMessage::Execute => "execute",
            ControlMessage::ExecuteAck { .. } => "execute_ack",
            ControlMessage::Reset { .. } => "reset",
            ControlMessage::DataRequest { .. } => "data_request",
            ControlMessage::Shutdown => "shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_encode_as_tagged_documents() {
        let msg = ControlMessage::Address {
            host: "10.0.0.7".into(),
            port: 10101,
            domain: "remote".into(),
        };

        let doc = serde_json::to_value(&msg).unwrap();
        assert_eq!(doc["type"], "address");
        assert_eq!(doc["content"]["port"], 10101);

        let back: ControlMessage = serde_json::from_value(doc).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn resource_descriptor_tags_resources_by_kind() {
        let msg = ControlMessage::Resource(ResourceDescriptor {
            codelet: "ex.Sort".into(),
            parameters: json!({"chunk": 4}),
            resource_in: vec![ResourceSpec::Handle {
                name: "in".into(),
                handles: vec![HandlePair::new("file:///tmp/a", "a")],
            }],
            resource_out: vec![ResourceSpec::Stream {
                identifier: "0000002a".into(),
                name: "out".into(),
                address: Some("127.0.0.1:9000".parse().unwrap()),
                inverted: false,
            }],
        });

        let doc = serde_json::to_value(&msg).unwrap();
        let content = &doc["content"];
        assert_eq!(content["resource_in"][0]["kind"], "handle");
        assert_eq!(content["resource_out"][0]["kind"], "stream");
    }

    #[test]
    fn execute_ack_defaults_are_empty() {
        let doc = json!({"type": "execute_ack", "content": {}});
        let msg: ControlMessage = serde_json::from_value(doc).unwrap();
        match msg {
            ControlMessage::ExecuteAck {
                embedding_parameters,
                edge_parameters,
            } => {
                assert!(embedding_parameters.is_null());
                assert!(edge_parameters.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
