//! Common test utilities for server integration tests.

#![allow(dead_code)]

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use weft_core::message::{ControlMessage, ResourceDescriptor};
use weft_core::prelude::*;
use weft_server::{InMemoryTransport, ServerConfig, ServerHandle, ServerProcessor};

/// Installs the `RUST_LOG`-driven subscriber, once per test binary.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn spawn_server() -> ServerHandle {
    init_tracing();
    ServerProcessor::spawn(ServerConfig::default())
}

/// A scripted worker driven over an in-memory transport.
pub struct Worker {
    transport: InMemoryTransport,
}

impl Worker {
    /// Connects, announces the given address, and consumes the greeting.
    pub async fn connect(handle: &ServerHandle, host: &str, port: u16, domain: &str) -> Self {
        let mut transport = InMemoryTransport::connect(handle, host, port, domain);
        match recv_from(&mut transport).await {
            ControlMessage::Init => {}
            other => panic!("expected init, got {other:?}"),
        }
        Self { transport }
    }

    pub fn id(&self) -> WorkerId {
        self.transport.worker()
    }

    pub async fn recv(&mut self) -> ControlMessage {
        recv_from(&mut self.transport).await
    }

    pub fn try_recv(&mut self) -> Option<ControlMessage> {
        self.transport.try_recv()
    }

    pub fn send(&self, message: ControlMessage) {
        self.transport.send(message);
    }

    pub fn fail(&self, message: &str) {
        self.transport.fail(message);
    }

    pub fn disconnect(&self) {
        self.transport.end_of_stream();
    }

    pub async fn expect_resource(&mut self) -> ResourceDescriptor {
        match self.recv().await {
            ControlMessage::Resource(descriptor) => descriptor,
            other => panic!("expected resource, got {other:?}"),
        }
    }

    /// Drives one full codelet lifecycle and returns its descriptor.
    pub async fn run_codelet(&mut self) -> ResourceDescriptor {
        let descriptor = self.expect_resource().await;
        self.send(ControlMessage::ResourceAck);
        match self.recv().await {
            ControlMessage::Prepare => {}
            other => panic!("expected prepare, got {other:?}"),
        }
        self.send(ControlMessage::PrepareAck);
        match self.recv().await {
            ControlMessage::Execute => {}
            other => panic!("expected execute, got {other:?}"),
        }
        self.send(ControlMessage::ExecuteAck {
            embedding_parameters: Value::Null,
            edge_parameters: Vec::new(),
        });
        descriptor
    }
}

async fn recv_from(transport: &mut InMemoryTransport) -> ControlMessage {
    tokio::time::timeout(Duration::from_secs(5), transport.recv())
        .await
        .expect("server went silent")
        .expect("transport closed")
}

/// Waits until the processor has drained everything queued before this
/// call. Queries share the event queue, so the round trip is a fence.
pub async fn fence(handle: &ServerHandle) {
    handle.pending_count(None).await.expect("processor alive");
}

/// A builder producing independent nodes, one singleton class each.
pub fn parallel_nodes(nodes: Vec<FlowNode>) -> Arc<dyn FlowBuilder> {
    Arc::new(FnBuilder(
        move |ctx: &mut BuildContext<'_>, _: &Value, _: &[EdgeId], _: &[NodeId]| {
            for node in &nodes {
                ctx.add_node(node.clone());
            }
            Ok(())
        },
    ))
}
