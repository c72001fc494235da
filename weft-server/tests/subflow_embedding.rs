//! Integration tests for embedding codelets: a finished placeholder is
//! replaced by its subflow and the schedule is rebuilt around it.

mod common;

use common::{spawn_server, Worker};
use serde_json::Value;
use std::sync::Arc;
use weft_core::message::HandlePair;
use weft_core::prelude::*;
use weft_server::FlowFlags;

/// A three-stage flow whose middle node expands into two parallel
/// workers at runtime: create -> split -> merge, where split's in-edge
/// carries two handle pairs and fans out on embedding.
fn two_way_split() -> Arc<dyn FlowBuilder> {
    let subflow: Arc<dyn FlowBuilder> = Arc::new(FnBuilder(
        |ctx: &mut BuildContext<'_>, _: &Value, in_edges: &[EdgeId], out_nodes: &[NodeId]| {
            let x = ctx.add_node(FlowNode::new("ex.Part"));
            let y = ctx.add_node(FlowNode::new("ex.Part"));
            ctx.attach_in(in_edges[0], x)?;
            ctx.attach_in(in_edges[1], y)?;
            ctx.add_edge(FlowEdge::handle(x, out_nodes[0]).with_name("px"))?;
            ctx.add_edge(FlowEdge::handle(y, out_nodes[0]).with_name("py"))?;
            Ok(())
        },
    ));
    Arc::new(FnBuilder(
        move |ctx: &mut BuildContext<'_>, _: &Value, _: &[EdgeId], _: &[NodeId]| {
            let a = ctx.add_node(FlowNode::new("ex.Create"));
            let b = ctx.add_node(FlowNode::new("ex.Split").with_embedding(subflow.clone()));
            let c = ctx.add_node(FlowNode::new("ex.Merge"));
            ctx.add_edge(
                FlowEdge::handle(a, b)
                    .with_name("h")
                    .with_expand_on_embed(true)
                    .with_handles(vec![
                        HandlePair::new("file:///tmp/part0", "part0"),
                        HandlePair::new("file:///tmp/part1", "part1"),
                    ]),
            )?;
            ctx.add_edge(FlowEdge::dummy(b, c))?;
            Ok(())
        },
    ))
}

#[tokio::test]
async fn an_embedding_codelet_splices_its_subflow_in() {
    let handle = spawn_server();
    let mut proxy = handle
        .create_flow("split", two_way_split(), Value::Null, FlowFlags::NONE, Value::Null)
        .await
        .unwrap();
    let mut worker = Worker::connect(&handle, "127.0.0.1", 9700, "").await;

    assert_eq!(worker.run_codelet().await.codelet, "ex.Create");

    let split = worker.run_codelet().await;
    assert_eq!(split.codelet, "ex.Split");
    // The placeholder sees its whole fan-in as one resource; the dummy
    // boundary edge renders nothing.
    assert_eq!(split.resource_in.len(), 1);
    assert!(split.resource_out.is_empty());

    // The placeholder is gone; its two-part subflow runs in its place,
    // one pair of the original fan-in each.
    for _ in 0..2 {
        let part = worker.run_codelet().await;
        assert_eq!(part.codelet, "ex.Part");
        assert_eq!(part.resource_in.len(), 1);
    }

    let merge = worker.run_codelet().await;
    assert_eq!(merge.codelet, "ex.Merge");
    assert_eq!(merge.resource_in.len(), 2);

    proxy.await_done().await.unwrap();
    let snapshot = proxy.snapshot().await.unwrap();
    assert_eq!(snapshot.status, FlowStatus::Finished);
    assert!(snapshot
        .classes
        .iter()
        .all(|class| class.status == LogicalNodeStatus::Finished));
}

#[tokio::test]
async fn a_failing_embedding_purges_the_flow() {
    let handle = spawn_server();
    let broken: Arc<dyn FlowBuilder> = Arc::new(FnBuilder(
        |_: &mut BuildContext<'_>, _: &Value, _: &[EdgeId], _: &[NodeId]| {
            // Binds none of its boundary in-edges.
            Ok(())
        },
    ));
    let builder: Arc<dyn FlowBuilder> = Arc::new(FnBuilder(
        move |ctx: &mut BuildContext<'_>, _: &Value, _: &[EdgeId], _: &[NodeId]| {
            let a = ctx.add_node(FlowNode::new("ex.Create"));
            let b = ctx.add_node(FlowNode::new("ex.Broken").with_embedding(broken.clone()));
            ctx.add_edge(
                FlowEdge::handle(a, b)
                    .with_name("h")
                    .with_handles(vec![HandlePair::new("file:///tmp/x", "x")]),
            )?;
            Ok(())
        },
    ));
    let mut proxy = handle
        .create_flow("broken", builder, Value::Null, FlowFlags::NONE, Value::Null)
        .await
        .unwrap();
    let mut worker = Worker::connect(&handle, "127.0.0.1", 9710, "").await;

    assert_eq!(worker.run_codelet().await.codelet, "ex.Create");
    assert_eq!(worker.run_codelet().await.codelet, "ex.Broken");

    let err = proxy.await_done().await.unwrap_err();
    assert!(err.to_string().contains("an in-edge was not bound"));
}
