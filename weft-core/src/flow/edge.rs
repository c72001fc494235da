//! Physical edges of the flow graph.

use crate::message::{HandlePair, ResourceSpec};
use crate::types::{create_identifier, EdgeId, NodeId};
use std::net::SocketAddr;

/// The kind-specific half of a [`FlowEdge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeKind {
    /// Data passed as named, stem-qualified references resolved by the
    /// worker.
    Handle {
        /// Whether the edge expands into one edge per handle pair when
        /// its consumer is replaced by an embedded subflow.
        expand_on_embed: bool,
        /// The (handle, stem) pairs bound to this edge.
        handles: Vec<HandlePair>,
    },
    /// A live TCP byte stream between the two workers.
    Stream {
        /// Whether the connection is established in the reverse
        /// direction (consumer connects to producer).
        inverted: bool,
        /// The negotiation identifier, regenerated on every dispatch.
        identifier: Option<String>,
    },
    /// Ordering only; carries no payload. Used to anchor embedding
    /// boundaries.
    Dummy,
}

/// A directed relationship between two flow nodes.
///
/// Edges store endpoint ids, never references; they are cloned, not
/// shared, whenever a flow is copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEdge {
    /// This edge's id in the owning flow's arena.
    pub id: EdgeId,
    /// The producing node.
    pub u: NodeId,
    /// The consuming node.
    pub v: NodeId,
    /// The name codelets look the edge's resource up by.
    pub name: String,
    /// Kind and kind-specific state.
    pub kind: EdgeKind,
}

impl FlowEdge {
    /// Creates a handle edge between two previously added nodes.
    ///
    /// The id is a placeholder until the edge is added to a flow through
    /// a build context, which assigns the arena id.
    pub fn handle(u: NodeId, v: NodeId) -> Self {
        Self {
            id: EdgeId(u32::MAX),
            u,
            v,
            name: String::new(),
            kind: EdgeKind::Handle {
                expand_on_embed: false,
                handles: Vec::new(),
            },
        }
    }

    /// Creates a stream edge between two previously added nodes.
    pub fn stream(u: NodeId, v: NodeId) -> Self {
        Self {
            id: EdgeId(u32::MAX),
            u,
            v,
            name: String::new(),
            kind: EdgeKind::Stream {
                inverted: false,
                identifier: None,
            },
        }
    }

    /// Creates a dummy edge between two previously added nodes.
    pub fn dummy(u: NodeId, v: NodeId) -> Self {
        Self {
            id: EdgeId(u32::MAX),
            u,
            v,
            name: String::new(),
            kind: EdgeKind::Dummy,
        }
    }

    /// Sets the edge name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Marks a handle edge for expansion at embed time.
    ///
    /// No effect on other kinds.
    pub fn with_expand_on_embed(mut self, expand: bool) -> Self {
        if let EdgeKind::Handle {
            expand_on_embed, ..
        } = &mut self.kind
        {
            *expand_on_embed = expand;
        }
        self
    }

    /// Binds (handle, stem) pairs to a handle edge.
    ///
    /// No effect on other kinds.
    pub fn with_handles(mut self, pairs: Vec<HandlePair>) -> Self {
        if let EdgeKind::Handle { handles, .. } = &mut self.kind {
            *handles = pairs;
        }
        self
    }

    /// Reverses the connect direction of a stream edge.
    ///
    /// No effect on other kinds.
    pub fn with_inverted(mut self, flag: bool) -> Self {
        if let EdgeKind::Stream { inverted, .. } = &mut self.kind {
            *inverted = flag;
        }
        self
    }

    /// True for stream edges.
    pub fn is_stream(&self) -> bool {
        matches!(self.kind, EdgeKind::Stream { .. })
    }

    /// True for dummy edges.
    pub fn is_dummy(&self) -> bool {
        matches!(self.kind, EdgeKind::Dummy)
    }

    /// Regenerates the negotiation identifier.
    ///
    /// Stream edges mint a fresh identifier before each dispatch, since
    /// the resource descriptors built afterwards reference it. Other
    /// kinds have nothing to regenerate.
    pub fn generate(&mut self) {
        if let EdgeKind::Stream { identifier, .. } = &mut self.kind {
            *identifier = Some(create_identifier());
        }
    }

    /// Renders the producer-side (out) resource.
    ///
    /// `peer_addr` is the consuming worker's address; a non-inverted
    /// stream tells the producer to connect there.
    pub fn u_resource(&self, peer_addr: Option<SocketAddr>) -> Option<ResourceSpec> {
        match &self.kind {
            EdgeKind::Handle { .. } => Some(ResourceSpec::Handle {
                name: self.name.clone(),
                handles: Vec::new(),
            }),
            EdgeKind::Stream {
                inverted,
                identifier,
            } => Some(ResourceSpec::Stream {
                identifier: identifier.clone().unwrap_or_default(),
                name: self.name.clone(),
                address: if *inverted { None } else { peer_addr },
                inverted: *inverted,
            }),
            EdgeKind::Dummy => None,
        }
    }

    /// Renders the consumer-side (in) resource.
    ///
    /// `peer_addr` is the producing worker's address; an inverted stream
    /// tells the consumer to connect there.
    pub fn v_resource(&self, peer_addr: Option<SocketAddr>) -> Option<ResourceSpec> {
        match &self.kind {
            EdgeKind::Handle { handles, .. } => Some(ResourceSpec::Handle {
                name: self.name.clone(),
                handles: handles.clone(),
            }),
            EdgeKind::Stream {
                inverted,
                identifier,
            } => Some(ResourceSpec::Stream {
                identifier: identifier.clone().unwrap_or_default(),
                name: self.name.clone(),
                address: if *inverted { peer_addr } else { None },
                inverted: *inverted,
            }),
            EdgeKind::Dummy => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_addresses_follow_inversion() {
        let addr: SocketAddr = "192.168.1.5:4000".parse().unwrap();

        let mut edge = FlowEdge::stream(NodeId(0), NodeId(1)).with_name("s");
        edge.generate();

        // Default direction: producer connects to the consumer.
        match edge.u_resource(Some(addr)).unwrap() {
            ResourceSpec::Stream { address, .. } => assert_eq!(address, Some(addr)),
            other => panic!("unexpected resource: {other:?}"),
        }
        match edge.v_resource(Some(addr)).unwrap() {
            ResourceSpec::Stream { address, .. } => assert_eq!(address, None),
            other => panic!("unexpected resource: {other:?}"),
        }

        // Inverted: consumer connects to the producer.
        let mut edge = edge.with_inverted(true);
        edge.generate();
        match edge.u_resource(Some(addr)).unwrap() {
            ResourceSpec::Stream { address, .. } => assert_eq!(address, None),
            other => panic!("unexpected resource: {other:?}"),
        }
        match edge.v_resource(Some(addr)).unwrap() {
            ResourceSpec::Stream { address, .. } => assert_eq!(address, Some(addr)),
            other => panic!("unexpected resource: {other:?}"),
        }
    }

    #[test]
    fn dummy_edges_render_no_resource() {
        let edge = FlowEdge::dummy(NodeId(0), NodeId(1));
        assert!(edge.u_resource(None).is_none());
        assert!(edge.v_resource(None).is_none());
    }

    #[test]
    fn generate_replaces_stream_identifier() {
        let mut edge = FlowEdge::stream(NodeId(0), NodeId(1));
        edge.generate();
        let first = match &edge.kind {
            EdgeKind::Stream { identifier, .. } => identifier.clone().unwrap(),
            _ => unreachable!(),
        };
        edge.generate();
        let second = match &edge.kind {
            EdgeKind::Stream { identifier, .. } => identifier.clone().unwrap(),
            _ => unreachable!(),
        };
        assert_ne!(first, second);
    }
}
