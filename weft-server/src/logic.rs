//! The orchestration state machine.
//!
//! [`ServerLogic`] owns every piece of mutable server state: connected
//! workers, enrolled flows, the execute list, and the event bus. It is
//! driven single-threadedly by the processor loop, one
//! [`ServerEvent`] at a time, so no handler ever observes another
//! handler mid-mutation.

use crate::client::{ClientState, ClientStatus};
use crate::config::ServerConfig;
use crate::events::{
    ClassSnapshot, FlowEvent, FlowEventBus, FlowEventKind, FlowFlags, FlowOutcome, FlowSnapshot,
    QueryRequest, ServerEvent,
};
use crate::timer::TimerService;
use crate::transport::Connection;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use weft_core::flow::node::{DEFAULT_CODELET_RETRIES, DEFAULT_CODELET_TIMEOUT};
use weft_core::flow::{EmbedRequest, Flow, FlowStatus, LogicalNodeStatus};
use weft_core::matching::match_requirements;
use weft_core::message::{ControlMessage, EdgeParameters};
use weft_core::types::{create_identifier, ClassId, FlowId, NodeId, WorkerId};
use weft_core::WeftError;

/// One enrolled flow and its bookkeeping.
struct FlowEntry {
    flow: Flow,
    flags: FlowFlags,
    done_tx: watch::Sender<FlowOutcome>,
    /// Every proxy is gone; reclaim the entry once the flow settles.
    released: bool,
}

/// The server's entire mutable state and its event handlers.
pub struct ServerLogic {
    config: ServerConfig,
    clients: HashMap<WorkerId, ClientState>,
    wait_set: BTreeSet<WorkerId>,
    flows: HashMap<FlowId, FlowEntry>,
    /// Classes awaiting worker assignment, as (flow, class) pairs.
    execute_list: Vec<(FlowId, ClassId)>,
    next_flow: u64,
    auto_close: bool,
    suspended: bool,
    timers: TimerService,
    self_tx: UnboundedSender<ServerEvent>,
    bus: FlowEventBus,
    data_key_pattern: Regex,
}

impl ServerLogic {
    /// Creates the state machine. `self_tx` feeds the same queue the
    /// processor drains; timers and deferred refreshes go through it.
    pub fn new(config: ServerConfig, self_tx: UnboundedSender<ServerEvent>) -> Self {
        let auto_close = config.auto_close;
        let bus = FlowEventBus::new(config.event_backlog);
        Self {
            config,
            clients: HashMap::new(),
            wait_set: BTreeSet::new(),
            flows: HashMap::new(),
            execute_list: Vec::new(),
            next_flow: 0,
            auto_close,
            suspended: false,
            timers: TimerService::new(self_tx.clone()),
            self_tx,
            bus,
            data_key_pattern: Regex::new("^([^:]+):(.*)$").expect("pattern is valid"),
        }
    }

    /// Handles one event. Returns `false` when the loop should stop.
    pub fn process(&mut self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::Connected { connection } => self.handle_connected(connection),
            ServerEvent::Message { worker, message } => self.handle_message(worker, message),
            ServerEvent::EndOfStream { worker } => {
                self.handle_connection_down(worker, "end of stream".into())
            }
            ServerEvent::Failed { worker, message } => {
                self.handle_connection_down(worker, message)
            }
            ServerEvent::Timeout { worker, token } => self.handle_timeout(worker, token),
            ServerEvent::Refresh => self.handle_refresh(),
            ServerEvent::Suspend => {
                info!("scheduling suspended");
                self.suspended = true;
            }
            ServerEvent::Resume => {
                info!("scheduling resumed");
                self.suspended = false;
                self.handle_refresh();
            }
            ServerEvent::Query(query) => self.handle_query(query),
            ServerEvent::Release(flow) => self.handle_release(flow),
            ServerEvent::Shutdown => {
                self.handle_shutdown();
                return false;
            }
        }
        true
    }

    fn request_refresh(&self) {
        let _ = self.self_tx.send(ServerEvent::Refresh);
    }

    fn handle_connected(&mut self, connection: Connection) {
        let worker = connection.worker();
        debug!(%worker, "worker connected");
        connection.send(ControlMessage::Init);
        self.clients.insert(worker, ClientState::new(connection));
    }

    /// Dispatches a worker message against its protocol position.
    /// A pair the state machine cannot accept invalidates the
    /// connection.
    fn handle_message(&mut self, worker: WorkerId, message: ControlMessage) {
        let Some(client) = self.clients.get(&worker) else {
            debug!(%worker, kind = message.kind(), "message from unknown worker dropped");
            return;
        };
        if client.status == ClientStatus::Invalid {
            debug!(%worker, kind = message.kind(), "message from invalid worker dropped");
            return;
        }
        match (client.status, message) {
            (ClientStatus::Idle, ControlMessage::Address { host, port, domain }) => {
                self.handle_idle_to_wait(worker, host, port, domain)
            }
            (ClientStatus::Resource, ControlMessage::ResourceAck) => {
                self.handle_resource_to_prepare(worker)
            }
            (ClientStatus::Prepare, ControlMessage::PrepareAck) => {
                self.handle_prepare_to_execute(worker)
            }
            (
                ClientStatus::Execute,
                ControlMessage::ExecuteAck {
                    embedding_parameters,
                    edge_parameters,
                },
            ) => self.handle_execute_to_wait(worker, embedding_parameters, edge_parameters),
            (ClientStatus::Execute, ControlMessage::DataRequest { key, .. }) => {
                self.handle_data_request(worker, key)
            }
            (
                ClientStatus::Resource | ClientStatus::Prepare | ClientStatus::Execute,
                ControlMessage::Reset { message, cause },
            ) => self.handle_worker_reset(worker, message, cause),
            (status, message) => self.handle_protocol_violation(
                worker,
                format!("{} not accepted in {status:?}", message.kind()),
            ),
        }
    }

    /// A worker announced its stream address and domain; enroll it.
    ///
    /// Loopback announcements are rewritten to the configured host so
    /// that peers elsewhere can still reach the worker, and default to
    /// the "local" domain; everything else defaults to "remote". A
    /// declared domain wins over the default unless it claims the
    /// opposite locality; that conflict is resolved in favor of the
    /// observed address.
    fn handle_idle_to_wait(&mut self, worker: WorkerId, host: String, port: u16, domain: String) {
        let ip = if host == "localhost" {
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        } else {
            host.parse::<IpAddr>().ok()
        };
        let Some(ip) = ip else {
            self.handle_protocol_violation(worker, format!("unresolvable address '{host}'"));
            return;
        };
        let (address, default_domain, conflicting) = if ip.is_loopback() {
            (SocketAddr::new(self.config.host, port), "local", "remote")
        } else {
            (SocketAddr::new(ip, port), "remote", "local")
        };
        let client = self.clients.get_mut(&worker).expect("dispatched above");
        client.address = Some(address);
        client.domain = if domain.is_empty() || domain == conflicting {
            default_domain.to_owned()
        } else {
            domain
        };
        client.status = ClientStatus::Wait;
        info!(%worker, %address, domain = %client.domain, "worker enrolled");
        self.wait_set.insert(worker);
        self.request_refresh();
    }

    /// Assigns idle workers to execute-eligible classes.
    ///
    /// Classes are considered smallest first; the scan stops at the
    /// first class larger than the remaining idle pool, since every
    /// later one is at least as large. A class whose requirements the
    /// pool cannot fully satisfy is skipped, not failed; the next
    /// enrollment retries it.
    fn handle_refresh(&mut self) {
        if self.suspended {
            return;
        }
        self.prune_execute_list();

        let mut list = std::mem::take(&mut self.execute_list);
        {
            let flows = &self.flows;
            list.sort_by_key(|&(fid, cid)| flows[&fid].flow.class(cid).size());
        }

        let mut deferred = Vec::new();
        let mut remaining = list.into_iter();
        for (fid, cid) in remaining.by_ref() {
            if self.flows[&fid].flow.class(cid).size() > self.wait_set.len() {
                deferred.push((fid, cid));
                break;
            }
            if !self.try_dispatch(fid, cid) {
                deferred.push((fid, cid));
            }
        }
        deferred.extend(remaining);
        deferred.extend(std::mem::take(&mut self.execute_list));
        self.execute_list = deferred;

        if self.auto_close && self.execute_list.is_empty() {
            let closed = self.close_idle_workers();
            if closed > 0 {
                info!(closed, "surplus idle workers shut down");
            }
        }
    }

    /// Drops execute entries whose flow or class no longer exists or
    /// has moved on.
    fn prune_execute_list(&mut self) {
        let flows = &self.flows;
        self.execute_list.retain(|&(fid, cid)| {
            flows
                .get(&fid)
                .map(|entry| {
                    entry.flow.contains_class(cid)
                        && entry.flow.class(cid).status == LogicalNodeStatus::PendingExecute
                })
                .unwrap_or(false)
        });
    }

    /// Attempts to bind workers to every member of one class and ship
    /// their RESOURCE descriptors. Returns `false` on a partial match.
    fn try_dispatch(&mut self, fid: FlowId, cid: ClassId) -> bool {
        let idle: Vec<WorkerId> = self.wait_set.iter().copied().collect();
        let domains: Vec<String> = idle
            .iter()
            .map(|w| self.clients[w].domain.clone())
            .collect();

        let assignments: Vec<(NodeId, WorkerId)> = {
            let flow = &self.flows[&fid].flow;
            let mut members: Vec<NodeId> = flow.class(cid).members.iter().copied().collect();
            members.sort_unstable();
            let nodes: Vec<&weft_core::flow::FlowNode> =
                members.iter().map(|&n| flow.node(n)).collect();
            let matches = match_requirements(self.config.matcher, &nodes, &domains);
            if matches.len() < members.len() {
                debug!(
                    flow = %fid, class = %cid,
                    matched = matches.len(), needed = members.len(),
                    "requirements not satisfiable by the idle pool"
                );
                return false;
            }
            matches
                .into_iter()
                .map(|(ri, si)| (members[ri], idle[si]))
                .collect()
        };

        // Bind workers and mint fresh stream identifiers before any
        // descriptor is rendered; descriptors reference both.
        let entry = self.flows.get_mut(&fid).expect("checked above");
        for &(node, worker) in &assignments {
            entry.flow.node_mut(node).worker = Some(worker);
        }
        entry.flow.generate_streams(cid);
        {
            let class = entry.flow.class_mut(cid);
            class.status = LogicalNodeStatus::Resource;
            class.reset_client_count_down();
        }

        let descriptors: Vec<ControlMessage> = {
            let clients = &self.clients;
            let addr_of = |w: WorkerId| clients.get(&w).and_then(|c| c.address);
            assignments
                .iter()
                .map(|&(node, _)| {
                    ControlMessage::Resource(entry.flow.resource_descriptor(node, addr_of))
                })
                .collect()
        };

        for (&(node, worker), descriptor) in assignments.iter().zip(descriptors) {
            let client = self.clients.get_mut(&worker).expect("idle workers are known");
            client.status = ClientStatus::Resource;
            client.assignment = Some((fid, node));
            client.connection.send(descriptor);
            client.arm_timeout(&self.timers, self.config.client_timeout);
            self.wait_set.remove(&worker);
        }
        info!(
            flow = %fid, class = %cid,
            workers = assignments.len(),
            "class dispatched"
        );
        true
    }

    fn close_idle_workers(&mut self) -> usize {
        let idle: Vec<WorkerId> = self.wait_set.iter().copied().collect();
        for worker in &idle {
            if let Some(mut client) = self.clients.remove(worker) {
                client.disarm_timeout();
                client.connection.send(ControlMessage::Shutdown);
            }
            self.wait_set.remove(worker);
        }
        idle.len()
    }

    /// One RESOURCE_ACK arrived; when the whole class has acked, send
    /// PREPARE to every member.
    fn handle_resource_to_prepare(&mut self, worker: WorkerId) {
        let Some((fid, node)) = self.assignment_of(worker) else {
            return;
        };
        self.clients
            .get_mut(&worker)
            .expect("dispatched above")
            .disarm_timeout();

        let Some(workers) = self.class_barrier(fid, node, worker) else {
            return;
        };
        let entry = self.flows.get_mut(&fid).expect("barrier checked");
        let cid = entry.flow.node(node).class.expect("bound nodes are classed");
        {
            let class = entry.flow.class_mut(cid);
            class.status = LogicalNodeStatus::Prepare;
            class.reset_client_count_down();
        }
        for w in workers {
            let client = self.clients.get_mut(&w).expect("bound workers are known");
            client.status = ClientStatus::Prepare;
            client.connection.send(ControlMessage::Prepare);
            client.arm_timeout(&self.timers, self.config.client_timeout);
        }
        debug!(flow = %fid, class = %cid, "class preparing");
    }

    /// One PREPARE_ACK arrived; when the whole class has acked, send
    /// EXECUTE to every member under its node's execution time limit.
    fn handle_prepare_to_execute(&mut self, worker: WorkerId) {
        let Some((fid, node)) = self.assignment_of(worker) else {
            return;
        };
        self.clients
            .get_mut(&worker)
            .expect("dispatched above")
            .disarm_timeout();

        let Some(workers) = self.class_barrier(fid, node, worker) else {
            return;
        };
        let entry = self.flows.get_mut(&fid).expect("barrier checked");
        let cid = entry.flow.node(node).class.expect("bound nodes are classed");
        {
            let class = entry.flow.class_mut(cid);
            class.status = LogicalNodeStatus::Execute;
            class.reset_client_count_down();
        }
        let limits: Vec<(WorkerId, std::time::Duration, Value)> = workers
            .iter()
            .map(|&w| {
                let (_, n) = self.clients[&w].assignment.expect("bound");
                let node = entry.flow.node(n);
                (w, node.timeout, node.attachment.clone())
            })
            .collect();
        for (w, limit, attachment) in limits {
            let client = self.clients.get_mut(&w).expect("bound workers are known");
            client.status = ClientStatus::Execute;
            client.connection.send(ControlMessage::Execute);
            client.arm_timeout(&self.timers, limit);
            self.publish(fid, FlowEventKind::NodeBegin, Some(attachment), None);
        }
        info!(flow = %fid, class = %cid, "class executing");
    }

    /// Registers one barrier arrival. Returns the class's bound
    /// workers when this arrival completed the barrier, `None` while
    /// peers are still outstanding. A duplicate arrival is a protocol
    /// violation.
    fn class_barrier(
        &mut self,
        fid: FlowId,
        node: NodeId,
        worker: WorkerId,
    ) -> Option<Vec<WorkerId>> {
        let cid = {
            let entry = self.flows.get(&fid)?;
            let cid = entry.flow.node(node).class.expect("bound nodes are classed");
            if !entry
                .flow
                .class(cid)
                .client_count_down
                .remaining()
                .contains(&node)
            {
                self.handle_protocol_violation(worker, "duplicate acknowledgement".into());
                return None;
            }
            cid
        };
        let done = self
            .flows
            .get_mut(&fid)?
            .flow
            .class_mut(cid)
            .client_count_down
            .arrive(&node);
        if !done {
            return None;
        }
        let entry = self.flows.get(&fid).expect("still enrolled");
        let workers = entry
            .flow
            .class(cid)
            .members
            .iter()
            .map(|&n| entry.flow.node(n).worker.expect("barrier implies bound"))
            .collect();
        Some(workers)
    }

    /// One EXECUTE_ACK arrived: apply the returned documents, return
    /// the worker to the wait pool, and when the whole class has acked,
    /// finish it and propagate downstream.
    fn handle_execute_to_wait(
        &mut self,
        worker: WorkerId,
        embedding_parameters: Value,
        edge_parameters: Vec<EdgeParameters>,
    ) {
        let Some((fid, node)) = self.assignment_of(worker) else {
            return;
        };
        {
            let client = self.clients.get_mut(&worker).expect("dispatched above");
            client.disarm_timeout();
        }

        let Some(entry) = self.flows.get_mut(&fid) else {
            // The flow was purged while this worker executed; the
            // worker already got its reset. Just re-enroll it.
            self.enroll_in_wait(worker);
            return;
        };
        if let Err(err) = entry
            .flow
            .assign_parameters(node, embedding_parameters, edge_parameters)
        {
            self.handle_worker_reset(worker, "returned parameters rejected".into(), err.to_string());
            return;
        }
        let cid = entry.flow.node(node).class.expect("bound nodes are classed");
        entry.flow.node_mut(node).worker = None;
        let node_attachment = entry.flow.node(node).attachment.clone();

        let pending = entry
            .flow
            .class(cid)
            .client_count_down
            .remaining()
            .contains(&node);
        if !pending {
            self.handle_protocol_violation(worker, "duplicate acknowledgement".into());
            return;
        }
        let class_done = entry
            .flow
            .class_mut(cid)
            .client_count_down
            .arrive(&node);

        self.enroll_in_wait(worker);
        self.publish(fid, FlowEventKind::NodeEnd, Some(node_attachment), None);
        if !class_done {
            return;
        }

        let entry = self.flows.get_mut(&fid).expect("still enrolled");
        entry.flow.class_mut(cid).status = LogicalNodeStatus::Finished;
        debug!(flow = %fid, class = %cid, "class finished");

        let embeds: Vec<NodeId> = {
            let flow = &entry.flow;
            let mut members: Vec<NodeId> = flow
                .class(cid)
                .members
                .iter()
                .copied()
                .filter(|&n| flow.node(n).is_embedding())
                .collect();
            members.sort_unstable();
            members
        };

        if !embeds.is_empty() {
            self.embed_and_reschedule(fid, embeds);
        } else {
            self.propagate_finished_class(fid, cid);
        }
    }

    /// Splices finished embedding nodes' subflows into the graph and
    /// rebuilds the schedule for the whole flow.
    fn embed_and_reschedule(&mut self, fid: FlowId, embeds: Vec<NodeId>) {
        // The rebuild recomputes eligibility from scratch; stale
        // entries for this flow would double-schedule.
        self.execute_list.retain(|&(f, _)| f != fid);

        let entry = self.flows.get_mut(&fid).expect("still enrolled");
        let requests: Vec<EmbedRequest> =
            embeds.iter().map(|&n| EmbedRequest::embedding(n)).collect();
        match entry.flow.build(requests) {
            Ok(eligible) => {
                info!(flow = %fid, embedded = embeds.len(), eligible = eligible.len(), "subflows embedded");
                let finished = !entry.flow.status.is_executing();
                for cid in eligible {
                    self.execute_list.push((fid, cid));
                }
                if finished {
                    self.finish_flow(fid);
                } else {
                    self.request_refresh();
                }
            }
            Err(err) => {
                warn!(flow = %fid, %err, "subflow embedding failed");
                self.purge_flow(fid, err.to_string());
            }
        }
    }

    /// Counts a finished class down against its dependents and the
    /// flow, scheduling whatever became eligible.
    fn propagate_finished_class(&mut self, fid: FlowId, cid: ClassId) {
        let entry = self.flows.get_mut(&fid).expect("still enrolled");
        let successors: Vec<ClassId> = entry.flow.class(cid).successors().collect();
        let mut newly_eligible = Vec::new();
        for successor in successors {
            let class = entry.flow.class_mut(successor);
            if class.dependency_count_down.arrive(&cid) && class.status.is_executable() {
                class.status = LogicalNodeStatus::PendingExecute;
                newly_eligible.push(successor);
            }
        }
        let flow_done = entry.flow.flow_count_down.arrive(&cid);
        for successor in newly_eligible {
            self.execute_list.push((fid, successor));
        }
        if flow_done {
            self.finish_flow(fid);
        } else {
            self.request_refresh();
        }
    }

    fn finish_flow(&mut self, fid: FlowId) {
        let entry = self.flows.get_mut(&fid).expect("still enrolled");
        entry.flow.status = FlowStatus::Finished;
        let _ = entry.done_tx.send(Some(Ok(())));
        info!(flow = %fid, name = %entry.flow.name, "flow finished");
        self.publish(fid, FlowEventKind::FlowEnd, None, None);
        if self.flows[&fid].released {
            self.flows.remove(&fid);
        }
    }

    /// A worker reported a failed attempt. Within the node's retry
    /// budget the class is reset and rescheduled; beyond it the whole
    /// flow is purged.
    fn handle_worker_reset(&mut self, worker: WorkerId, message: String, cause: String) {
        warn!(%worker, %message, %cause, "worker reset");
        let Some((fid, node)) = self.assignment_of(worker) else {
            return;
        };
        let Some(entry) = self.flows.get_mut(&fid) else {
            self.enroll_in_wait(worker);
            return;
        };
        let budget = entry.flow.node(node).retries;
        let consumed = entry.flow.node_mut(node).increment_retries();
        let cid = entry.flow.node(node).class.expect("bound nodes are classed");
        let node_attachment = entry.flow.node(node).attachment.clone();
        self.publish(
            fid,
            FlowEventKind::NodeError,
            Some(node_attachment),
            Some(format!("{message}: {cause}")),
        );
        if consumed > budget {
            let err = WeftError::RetryExhausted {
                node,
                retries: budget,
            };
            self.purge_flow(fid, err.to_string());
        } else {
            self.reset_class(fid, cid, Some(worker));
            self.request_refresh();
        }
    }

    /// Returns an executing class to the execute list, unbinding and
    /// re-enrolling its workers. Workers other than `exclude` are sent
    /// a RESET to abandon their staged state.
    fn reset_class(&mut self, fid: FlowId, cid: ClassId, exclude: Option<WorkerId>) {
        let Some(entry) = self.flows.get_mut(&fid) else {
            return;
        };
        let members: Vec<NodeId> = entry.flow.class(cid).members.iter().copied().collect();
        let mut bound = Vec::new();
        for node in members {
            if let Some(w) = entry.flow.node(node).worker {
                entry.flow.node_mut(node).worker = None;
                bound.push(w);
            }
        }
        {
            let class = entry.flow.class_mut(cid);
            class.status = LogicalNodeStatus::PendingExecute;
            class.reset_client_count_down();
        }
        if !self.execute_list.contains(&(fid, cid)) {
            self.execute_list.push((fid, cid));
        }
        for w in bound {
            if Some(w) != exclude {
                if let Some(client) = self.clients.get(&w) {
                    client.connection.send(ControlMessage::Reset {
                        message: "the assignment was reset".into(),
                        cause: String::new(),
                    });
                }
            }
            self.enroll_in_wait(w);
        }
        debug!(flow = %fid, class = %cid, "class reset");
    }

    /// Disarms and re-enrolls a worker into the wait pool, unless its
    /// connection was invalidated in the meantime.
    fn enroll_in_wait(&mut self, worker: WorkerId) {
        if let Some(client) = self.clients.get_mut(&worker) {
            if client.status != ClientStatus::Invalid {
                client.disarm_timeout();
                client.assignment = None;
                client.status = ClientStatus::Wait;
                self.wait_set.insert(worker);
            }
        }
    }

    /// The transport under a worker failed or closed; its record is
    /// dropped and any class it was serving is reset and rescheduled.
    fn handle_connection_down(&mut self, worker: WorkerId, message: String) {
        let Some(mut client) = self.clients.remove(&worker) else {
            return;
        };
        warn!(%worker, %message, "worker connection down");
        client.disarm_timeout();
        self.wait_set.remove(&worker);
        if let Some((fid, node)) = client.assignment {
            self.reset_bound_node(fid, node, worker, &message);
        }
    }

    /// A worker broke the protocol; its messages are dropped from now
    /// on and any class it was serving is reset and rescheduled.
    fn handle_protocol_violation(&mut self, worker: WorkerId, message: String) {
        let Some(client) = self.clients.get_mut(&worker) else {
            return;
        };
        warn!(%worker, %message, "protocol violation, connection invalidated");
        client.disarm_timeout();
        let assignment = client.assignment.take();
        client.status = ClientStatus::Invalid;
        self.wait_set.remove(&worker);
        if let Some((fid, node)) = assignment {
            self.reset_bound_node(fid, node, worker, &message);
        }
    }

    fn reset_bound_node(&mut self, fid: FlowId, node: NodeId, worker: WorkerId, message: &str) {
        let Some(entry) = self.flows.get(&fid) else {
            return;
        };
        if !entry.flow.contains_node(node) {
            return;
        }
        let cid = entry.flow.node(node).class.expect("bound nodes are classed");
        if entry.flow.class(cid).status.is_executing() {
            let node_attachment = entry.flow.node(node).attachment.clone();
            self.publish(
                fid,
                FlowEventKind::NodeError,
                Some(node_attachment),
                Some(message.to_owned()),
            );
            self.reset_class(fid, cid, Some(worker));
            self.request_refresh();
        }
    }

    /// A deadline fired. Stale tokens and settled workers are ignored;
    /// a missed acknowledgement invalidates the worker, while an
    /// expired execution purges the owning flow.
    fn handle_timeout(&mut self, worker: WorkerId, token: u64) {
        let Some(client) = self.clients.get(&worker) else {
            return;
        };
        if !client.timeout_is_current(token) {
            return;
        }
        match client.status {
            ClientStatus::Resource | ClientStatus::Prepare => {
                let err = WeftError::Timeout { worker };
                self.handle_protocol_violation(worker, err.to_string());
            }
            ClientStatus::Execute => {
                let Some((fid, node)) = client.assignment else {
                    return;
                };
                let limit_ms = self
                    .flows
                    .get(&fid)
                    .map(|entry| entry.flow.node(node).timeout.as_millis() as u64)
                    .unwrap_or(0);
                let err = WeftError::ExecutionExpired { limit_ms };
                warn!(%worker, flow = %fid, %err, "execution expired");
                self.purge_flow(fid, err.to_string());
            }
            _ => {}
        }
    }

    /// Fails a flow: every bound worker is reset and re-enrolled, the
    /// outcome channel reports the error, and subscribers get a
    /// flow-error event. The entry survives for snapshots until its
    /// last proxy is dropped.
    fn purge_flow(&mut self, fid: FlowId, error: String) {
        let Some(entry) = self.flows.get_mut(&fid) else {
            return;
        };
        if !entry.flow.status.is_executing() {
            return;
        }
        warn!(flow = %fid, name = %entry.flow.name, %error, "flow purged");
        self.execute_list.retain(|&(f, _)| f != fid);

        entry.flow.status = FlowStatus::Failed;
        let bound: Vec<(NodeId, WorkerId)> = entry
            .flow
            .nodes()
            .filter_map(|n| n.worker.map(|w| (n.id, w)))
            .collect();
        for &(node, _) in &bound {
            entry.flow.node_mut(node).worker = None;
        }
        let executing: Vec<ClassId> = entry
            .flow
            .class_ids()
            .into_iter()
            .filter(|&c| entry.flow.class(c).status.is_executing())
            .collect();
        for cid in executing {
            entry.flow.class_mut(cid).status = LogicalNodeStatus::Failed;
        }
        let _ = entry.done_tx.send(Some(Err(error.clone())));
        self.publish(fid, FlowEventKind::FlowError, None, Some(error.clone()));

        for (_, worker) in bound {
            if let Some(client) = self.clients.get(&worker) {
                client.connection.send(ControlMessage::Reset {
                    message: "the flow was purged".into(),
                    cause: error.clone(),
                });
            }
            self.enroll_in_wait(worker);
        }
        if self.flows[&fid].released {
            self.flows.remove(&fid);
        }
        self.request_refresh();
    }

    /// Serves a `mode:rest` data request from an executing worker.
    /// The only supported mode mints a process-unique identifier; an
    /// unservable request converts into a worker reset.
    fn handle_data_request(&mut self, worker: WorkerId, key: String) {
        let mode = self
            .data_key_pattern
            .captures(&key)
            .map(|c| c.get(1).expect("group 1 exists").as_str().to_owned());
        match mode.as_deref() {
            Some("id") => {
                if let Some(client) = self.clients.get(&worker) {
                    client.connection.send(ControlMessage::DataRequest {
                        key,
                        payload: Some(create_identifier().into_bytes()),
                    });
                }
            }
            _ => {
                self.handle_worker_reset(
                    worker,
                    "unservable data request".into(),
                    format!("key '{key}'"),
                );
            }
        }
    }

    fn handle_query(&mut self, query: QueryRequest) {
        match query {
            QueryRequest::CreateFlow {
                name,
                builder,
                parameters,
                flags,
                attachment,
                reply,
            } => {
                let _ = reply.send(self.create_flow(name, builder, parameters, flags, attachment));
            }
            QueryRequest::Snapshot { flow, reply } => {
                let _ = reply.send(self.snapshot(flow));
            }
            QueryRequest::Purge { flow, reply } => {
                let result = if self.flows.contains_key(&flow) {
                    self.purge_flow(flow, WeftError::Purged.to_string());
                    Ok(())
                } else {
                    Err(WeftError::Purged)
                };
                let _ = reply.send(result);
            }
            QueryRequest::SetAutoClose { value, reply } => {
                self.auto_close = value;
                let _ = reply.send(());
                if value {
                    self.request_refresh();
                }
            }
            QueryRequest::CloseIdle { reply } => {
                let _ = reply.send(self.close_idle_workers());
            }
            QueryRequest::PendingCount { flow, reply } => {
                let _ = reply.send(self.pending_count(flow));
            }
            QueryRequest::Subscribe { reply } => {
                let _ = reply.send(self.bus.subscribe());
            }
        }
    }

    fn create_flow(
        &mut self,
        name: String,
        builder: std::sync::Arc<dyn weft_core::flow::FlowBuilder>,
        parameters: Value,
        flags: FlowFlags,
        attachment: Value,
    ) -> weft_core::Result<(FlowId, watch::Receiver<FlowOutcome>)> {
        let fid = FlowId(self.next_flow);
        let mut flow = Flow::new(fid, name);
        flow.attachment = attachment;
        let eligible = flow.build(vec![EmbedRequest::initial(builder, parameters)])?;
        self.next_flow += 1;

        // Nodes still carrying the library defaults pick up the
        // configured ones.
        for id in flow.node_ids() {
            let node = flow.node_mut(id);
            if node.timeout == DEFAULT_CODELET_TIMEOUT {
                node.timeout = self.config.codelet_timeout;
            }
            if node.retries == DEFAULT_CODELET_RETRIES {
                node.retries = self.config.codelet_retries;
            }
        }

        info!(flow = %fid, name = %flow.name, nodes = flow.node_count(), "flow created");
        let finished = !flow.status.is_executing();
        let (done_tx, done_rx) = watch::channel(None);
        self.flows.insert(
            fid,
            FlowEntry {
                flow,
                flags,
                done_tx,
                released: false,
            },
        );
        for cid in eligible {
            self.execute_list.push((fid, cid));
        }
        self.publish(fid, FlowEventKind::FlowBegin, None, None);
        if finished {
            self.finish_flow(fid);
        } else {
            self.request_refresh();
        }
        Ok((fid, done_rx))
    }

    fn snapshot(&self, flow: Option<FlowId>) -> weft_core::Result<Vec<FlowSnapshot>> {
        let mut ids: Vec<FlowId> = match flow {
            Some(fid) => {
                if !self.flows.contains_key(&fid) {
                    return Err(WeftError::Purged);
                }
                vec![fid]
            }
            None => self.flows.keys().copied().collect(),
        };
        ids.sort_unstable();
        Ok(ids
            .into_iter()
            .map(|fid| {
                let entry = &self.flows[&fid];
                FlowSnapshot {
                    id: fid,
                    name: entry.flow.name.clone(),
                    status: entry.flow.status,
                    attachment: entry.flow.attachment.clone(),
                    classes: entry
                        .flow
                        .class_ids()
                        .into_iter()
                        .map(|cid| {
                            let class = entry.flow.class(cid);
                            ClassSnapshot {
                                id: cid,
                                status: class.status,
                                size: class.size(),
                            }
                        })
                        .collect(),
                }
            })
            .collect())
    }

    /// Sums the member counts of classes still awaiting workers.
    fn pending_count(&self, flow: Option<FlowId>) -> weft_core::Result<usize> {
        if let Some(fid) = flow {
            if !self.flows.contains_key(&fid) {
                return Err(WeftError::Purged);
            }
        }
        Ok(self
            .execute_list
            .iter()
            .filter(|&&(fid, _)| flow.map(|f| f == fid).unwrap_or(true))
            .map(|&(fid, cid)| self.flows[&fid].flow.class(cid).size())
            .sum())
    }

    fn handle_release(&mut self, fid: FlowId) {
        if let Some(entry) = self.flows.get_mut(&fid) {
            entry.released = true;
            if !entry.flow.status.is_executing() {
                self.flows.remove(&fid);
            }
        }
    }

    fn handle_shutdown(&mut self) {
        info!(workers = self.clients.len(), flows = self.flows.len(), "server shutting down");
        for client in self.clients.values_mut() {
            client.disarm_timeout();
            client.connection.send(ControlMessage::Shutdown);
        }
        self.clients.clear();
        self.wait_set.clear();
    }

    fn publish(
        &mut self,
        fid: FlowId,
        kind: FlowEventKind,
        node_attachment: Option<Value>,
        error: Option<String>,
    ) {
        let Some(entry) = self.flows.get(&fid) else {
            return;
        };
        let event = FlowEvent {
            kind,
            flow: fid,
            flow_attachment: entry.flow.attachment.clone(),
            node_attachment,
            error,
        };
        self.bus.publish(entry.flags, event);
    }

    fn assignment_of(&self, worker: WorkerId) -> Option<(FlowId, NodeId)> {
        self.clients.get(&worker).and_then(|c| c.assignment)
    }
}
