//! Static flow engine
//!
//! A static flow is a node type built from three arrays — node specs,
//! connection specs, exported-port specs — validated once and instantiated
//! many times. The instantiated engine owns its child nodes, routes packets
//! emitted by them in connection order, and implements the container-node
//! protocol so flows nest as ordinary children.
//!
//! Dispatch is queued: a send enqueues onto the enclosing flow's delayed
//! list and arms a single zero-delay dispatcher on the main loop. A pass
//! drains the queue observed at its start; sends during the pass arm a fresh
//! dispatcher and land in the next pass, preserving causal order.

use super::super::error::{FlowError, Result};
use super::super::packet::Packet;
use super::super::scheduling::{MainLoop, TimerHandle};
use super::context::{NodeContext, PacketOutlet};
use super::node::{ConnId, NamedOptions, Node, NodeOptions, NodeType, OptionsSchema, PortId, PortDescriptor};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// One child node in a flow spec.
pub struct NodeSpec {
    pub name: String,
    pub node_type: Arc<NodeType>,
    pub options: Option<NamedOptions>,
}

/// Directed connection between two child ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSpec {
    pub src_node: usize,
    pub src_port: PortId,
    pub dst_node: usize,
    pub dst_port: PortId,
}

/// Child port promoted to a port of the enclosing flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportedPortSpec {
    pub node: usize,
    pub port: PortId,
}

/// Patches a child's named-options table before schema resolution, given the
/// child index and the flow's own resolved options.
pub type ChildOptionsSetter = Box<dyn Fn(usize, &NodeOptions, &mut NamedOptions) + Send + Sync>;

struct Connection {
    spec: ConnectionSpec,
    out_conn_id: ConnId,
    in_conn_id: ConnId,
}

struct NodeInfo {
    first_conn: usize,
    in_port_count: usize,
    out_port_count: usize,
}

struct ExportedPort {
    node: usize,
    port: PortId,
    /// Internal connections already on this endpoint; parent-side connection
    /// ids are biased by this when delegated to the child.
    base_conn_id: ConnId,
    descriptor: PortDescriptor,
}

/// Engine state of one instantiated flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unopened,
    Opening,
    Connected,
    Dispatching,
    Closing,
    Closed,
}

/// Collects a flow spec and validates it into a [`StaticFlowType`].
pub struct StaticFlowBuilder {
    name: String,
    nodes: Vec<NodeSpec>,
    connections: Vec<ConnectionSpec>,
    exported_in: Vec<ExportedPortSpec>,
    exported_out: Vec<ExportedPortSpec>,
    options_schema: OptionsSchema,
    options_setter: Option<ChildOptionsSetter>,
}

impl StaticFlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            connections: Vec::new(),
            exported_in: Vec::new(),
            exported_out: Vec::new(),
            options_schema: OptionsSchema::empty(),
            options_setter: None,
        }
    }

    /// Add a child node; returns its index for use in connections.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        node_type: Arc<NodeType>,
        options: Option<NamedOptions>,
    ) -> usize {
        self.nodes.push(NodeSpec {
            name: name.into(),
            node_type,
            options,
        });
        self.nodes.len() - 1
    }

    pub fn connect(
        &mut self,
        src_node: usize,
        src_port: PortId,
        dst_node: usize,
        dst_port: PortId,
    ) -> &mut Self {
        self.connections.push(ConnectionSpec {
            src_node,
            src_port,
            dst_node,
            dst_port,
        });
        self
    }

    /// Connect by port names, resolved against the already-added node types.
    pub fn connect_named(
        &mut self,
        src_node: usize,
        src_port: &str,
        dst_node: usize,
        dst_port: &str,
    ) -> Result<&mut Self> {
        let src = self
            .nodes
            .get(src_node)
            .and_then(|n| n.node_type.find_out_port(src_port))
            .ok_or_else(|| {
                FlowError::NotFound(format!("output port '{}' on node {}", src_port, src_node))
            })?;
        let dst = self
            .nodes
            .get(dst_node)
            .and_then(|n| n.node_type.find_in_port(dst_port))
            .ok_or_else(|| {
                FlowError::NotFound(format!("input port '{}' on node {}", dst_port, dst_node))
            })?;
        Ok(self.connect(src_node, src, dst_node, dst))
    }

    pub fn export_in(&mut self, node: usize, port: PortId) -> &mut Self {
        self.exported_in.push(ExportedPortSpec { node, port });
        self
    }

    pub fn export_out(&mut self, node: usize, port: PortId) -> &mut Self {
        self.exported_out.push(ExportedPortSpec { node, port });
        self
    }

    /// Option schema of the flow itself, exposed when the flow is used as a
    /// child node.
    pub fn with_options_schema(&mut self, schema: OptionsSchema) -> &mut Self {
        self.options_schema = schema;
        self
    }

    pub fn with_child_options_setter(&mut self, setter: ChildOptionsSetter) -> &mut Self {
        self.options_setter = Some(setter);
        self
    }

    pub fn build(self) -> Result<Arc<StaticFlowType>> {
        StaticFlowType::build(self)
    }
}

/// Validated flow type. Implements the container-node protocol through
/// [`StaticFlowType::as_node_type`].
pub struct StaticFlowType {
    name: String,
    nodes: Vec<NodeSpec>,
    connections: Vec<Connection>,
    node_infos: Vec<NodeInfo>,
    exported_in: Vec<ExportedPort>,
    exported_out: Vec<ExportedPort>,
    options_schema: OptionsSchema,
    options_setter: Option<ChildOptionsSetter>,
}

impl StaticFlowType {
    fn build(builder: StaticFlowBuilder) -> Result<Arc<Self>> {
        let StaticFlowBuilder {
            name,
            nodes,
            connections,
            exported_in,
            exported_out,
            options_schema,
            options_setter,
        } = builder;

        if nodes.is_empty() {
            return Err(FlowError::InvalidArgument(
                "a flow needs at least one node".into(),
            ));
        }

        let mut node_infos: Vec<NodeInfo> = nodes
            .iter()
            .map(|spec| NodeInfo {
                first_conn: connections.len(),
                in_port_count: spec.node_type.in_ports().len(),
                out_port_count: spec.node_type.out_ports().len(),
            })
            .collect();

        let mut resolved = Vec::with_capacity(connections.len());
        let mut out_ids: HashMap<(usize, PortId), ConnId> = HashMap::new();
        let mut in_ids: HashMap<(usize, PortId), ConnId> = HashMap::new();
        let mut prev: Option<(usize, PortId)> = None;
        for (idx, spec) in connections.iter().enumerate() {
            let src_info = node_infos.get(spec.src_node).ok_or_else(|| {
                FlowError::InvalidArgument(format!(
                    "connection {} source node {} out of range",
                    idx, spec.src_node
                ))
            })?;
            if spec.src_port as usize >= src_info.out_port_count {
                return Err(FlowError::InvalidArgument(format!(
                    "connection {} source port {} out of range for node {}",
                    idx, spec.src_port, spec.src_node
                )));
            }
            let dst_info = node_infos.get(spec.dst_node).ok_or_else(|| {
                FlowError::InvalidArgument(format!(
                    "connection {} destination node {} out of range",
                    idx, spec.dst_node
                ))
            })?;
            if spec.dst_port as usize >= dst_info.in_port_count {
                return Err(FlowError::InvalidArgument(format!(
                    "connection {} destination port {} out of range for node {}",
                    idx, spec.dst_port, spec.dst_node
                )));
            }
            if let Some(prev) = prev {
                if (spec.src_node, spec.src_port) < prev {
                    return Err(FlowError::InvalidArgument(format!(
                        "connection {} violates (src-node, src-port) sort order",
                        idx
                    )));
                }
            }
            prev = Some((spec.src_node, spec.src_port));

            let src_ty = &nodes[spec.src_node].node_type.out_ports()[spec.src_port as usize];
            let dst_ty = &nodes[spec.dst_node].node_type.in_ports()[spec.dst_port as usize];
            if !src_ty.packet_type.matches(&dst_ty.packet_type) {
                return Err(FlowError::InvalidType(format!(
                    "connection {}: port {} ({}) does not match port {} ({})",
                    idx, src_ty.name, src_ty.packet_type, dst_ty.name, dst_ty.packet_type
                )));
            }

            if node_infos[spec.src_node].first_conn > idx {
                node_infos[spec.src_node].first_conn = idx;
            }
            let out_id = out_ids.entry((spec.src_node, spec.src_port)).or_insert(0);
            let in_id = in_ids.entry((spec.dst_node, spec.dst_port)).or_insert(0);
            resolved.push(Connection {
                spec: *spec,
                out_conn_id: *out_id,
                in_conn_id: *in_id,
            });
            *out_id += 1;
            *in_id += 1;
        }

        let exported_in = Self::resolve_exports(&nodes, &exported_in, &in_ids, false)?;
        let exported_out = Self::resolve_exports(&nodes, &exported_out, &out_ids, true)?;

        Ok(Arc::new(Self {
            name,
            nodes,
            connections: resolved,
            node_infos,
            exported_in,
            exported_out,
            options_schema,
            options_setter,
        }))
    }

    fn resolve_exports(
        nodes: &[NodeSpec],
        specs: &[ExportedPortSpec],
        used_ids: &HashMap<(usize, PortId), ConnId>,
        outputs: bool,
    ) -> Result<Vec<ExportedPort>> {
        let mut prev: Option<(usize, PortId)> = None;
        let mut resolved = Vec::with_capacity(specs.len());
        for spec in specs {
            let node = nodes.get(spec.node).ok_or_else(|| {
                FlowError::InvalidArgument(format!("exported node {} out of range", spec.node))
            })?;
            let ports = if outputs {
                node.node_type.out_ports()
            } else {
                node.node_type.in_ports()
            };
            let descriptor = ports.get(spec.port as usize).cloned().ok_or_else(|| {
                FlowError::InvalidArgument(format!(
                    "exported port {} out of range for node {}",
                    spec.port, spec.node
                ))
            })?;
            if let Some(prev) = prev {
                if spec.node < prev.0 || (spec.node == prev.0 && spec.port <= prev.1) {
                    return Err(FlowError::InvalidArgument(
                        "exported ports must be sorted by (node, port), strictly on port".into(),
                    ));
                }
            }
            prev = Some((spec.node, spec.port));
            resolved.push(ExportedPort {
                node: spec.node,
                port: spec.port,
                base_conn_id: used_ids.get(&(spec.node, spec.port)).copied().unwrap_or(0),
                descriptor,
            });
        }
        Ok(resolved)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn exported_out_position(&self, node: usize, port: PortId) -> Option<usize> {
        self.exported_out
            .iter()
            .position(|e| e.node == node && e.port == port)
    }

    /// The container-node protocol: a flow type is itself a node type whose
    /// ports are the exported ports.
    pub fn as_node_type(self: &Arc<Self>) -> Arc<NodeType> {
        let flow = Arc::clone(self);
        let ty = NodeType::new(self.name.clone(), move || {
            Ok(Box::new(FlowNode::new(Arc::clone(&flow))) as Box<dyn Node>)
        })
        .with_in_ports(
            self.exported_in
                .iter()
                .map(|e| e.descriptor.clone())
                .collect(),
        )
        .with_out_ports(
            self.exported_out
                .iter()
                .map(|e| e.descriptor.clone())
                .collect(),
        )
        .with_options(self.options_schema.clone());
        Arc::new(ty)
    }
}

struct QueuedSend {
    src: usize,
    src_port: PortId,
    packet: Packet,
}

struct Child {
    name: String,
    node: Box<dyn Node>,
}

struct FlowBody {
    children: Vec<Child>,
    state: EngineState,
}

struct Uplink {
    outlet: Arc<dyn PacketOutlet>,
    node_index: usize,
}

/// State shared between the flow node, its children's contexts, and the
/// armed dispatcher. The body is held weakly so a pending dispatcher never
/// keeps a closed flow alive.
struct FlowShared {
    ty: Arc<StaticFlowType>,
    main_loop: MainLoop,
    self_ref: Weak<FlowShared>,
    queue: Mutex<VecDeque<QueuedSend>>,
    dispatcher: Mutex<Option<TimerHandle>>,
    body: Mutex<Weak<Mutex<FlowBody>>>,
    uplink: Mutex<Option<Uplink>>,
    closing: AtomicBool,
}

impl FlowShared {
    fn new(ty: Arc<StaticFlowType>, main_loop: MainLoop) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            ty,
            main_loop,
            self_ref: weak.clone(),
            queue: Mutex::new(VecDeque::new()),
            dispatcher: Mutex::new(None),
            body: Mutex::new(Weak::new()),
            uplink: Mutex::new(None),
            closing: AtomicBool::new(false),
        })
    }

    fn outlet(self: &Arc<Self>) -> Arc<dyn PacketOutlet> {
        Arc::clone(self) as Arc<dyn PacketOutlet>
    }

    fn child_ctx(self: &Arc<Self>, index: usize) -> NodeContext {
        NodeContext::new(index, self.main_loop.clone(), Some(self.outlet()))
    }

    fn arm_dispatcher(&self) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }
        let weak = self.self_ref.clone();
        *dispatcher = Some(self.main_loop.defer(move || {
            if let Some(shared) = weak.upgrade() {
                shared.dispatch_pass();
            }
        }));
    }

    /// Drain the queue observed now. Sends made by process hooks land on a
    /// fresh queue and a freshly armed dispatcher.
    fn dispatch_pass(self: &Arc<Self>) {
        let _ = self.dispatcher.lock().take();
        let batch: Vec<QueuedSend> = self.queue.lock().drain(..).collect();
        if batch.is_empty() {
            return;
        }
        let Some(body_arc) = self.body.lock().upgrade() else {
            return;
        };
        let mut body = body_arc.lock();
        if !matches!(body.state, EngineState::Connected | EngineState::Dispatching) {
            debug!(
                flow = self.ty.name(),
                state = ?body.state,
                dropped = batch.len(),
                "dispatch pass while not connected, dropping queued packets"
            );
            return;
        }
        body.state = EngineState::Dispatching;
        for send in batch {
            self.deliver(&mut body, send);
        }
        body.state = EngineState::Connected;
    }

    fn deliver(self: &Arc<Self>, body: &mut FlowBody, send: QueuedSend) {
        let ty = &self.ty;
        let mut consumed = false;

        let first = ty.node_infos[send.src].first_conn;
        for conn in ty.connections[first..]
            .iter()
            .take_while(|c| c.spec.src_node == send.src)
        {
            if conn.spec.src_port != send.src_port {
                continue;
            }
            consumed = true;
            let dst = conn.spec.dst_node;
            let mut ctx = self.child_ctx(dst);
            if let Err(err) = body.children[dst].node.process(
                &mut ctx,
                conn.spec.dst_port,
                conn.in_conn_id,
                &send.packet,
            ) {
                warn!(
                    flow = ty.name(),
                    node = body.children[dst].name,
                    port = conn.spec.dst_port,
                    error = %err,
                    "process hook failed, continuing dispatch"
                );
            }
        }

        if let Some(export) = ty.exported_out_position(send.src, send.src_port) {
            let uplink = self.uplink.lock();
            match &*uplink {
                Some(up) => {
                    consumed = true;
                    if let Err(err) =
                        up.outlet
                            .send_from(up.node_index, export as PortId, send.packet.clone())
                    {
                        warn!(
                            flow = ty.name(),
                            export,
                            error = %err,
                            "exported packet rejected by enclosing flow"
                        );
                    }
                }
                None => {
                    debug!(
                        flow = ty.name(),
                        export, "exported packet dropped at top-level flow"
                    );
                }
            }
        }

        if !consumed && send.packet.is_error() {
            if let Ok((code, msg)) = send.packet.as_error() {
                warn!(
                    flow = ty.name(),
                    node = self.ty.nodes[send.src].name,
                    code,
                    msg = msg.unwrap_or(""),
                    "unhandled error packet"
                );
            }
        }
        // Queue ownership ends here; the packet is disposed with `send`.
    }
}

impl PacketOutlet for FlowShared {
    fn send_from(&self, node_index: usize, port: PortId, packet: Packet) -> Result<()> {
        if self.closing.load(Ordering::Relaxed) {
            debug!(
                flow = self.ty.name(),
                node_index, port, "send while closing, packet dropped"
            );
            return Ok(());
        }
        let spec = self.ty.nodes.get(node_index).ok_or_else(|| {
            FlowError::InvalidArgument(format!("sender index {} out of range", node_index))
        })?;
        let declared = spec
            .node_type
            .out_ports()
            .get(port as usize)
            .ok_or_else(|| {
                FlowError::InvalidArgument(format!(
                    "node '{}' has no output port {}",
                    spec.name, port
                ))
            })?;
        let actual = packet.packet_type();
        if !declared.packet_type.matches(&actual) {
            return Err(FlowError::InvalidType(format!(
                "packet of type {} sent on port '{}' of type {}",
                actual, declared.name, declared.packet_type
            )));
        }
        self.queue.lock().push_back(QueuedSend {
            src: node_index,
            src_port: port,
            packet,
        });
        self.arm_dispatcher();
        Ok(())
    }
}

struct OpenFlow {
    shared: Arc<FlowShared>,
    body: Arc<Mutex<FlowBody>>,
}

/// Instantiated flow engine. Created by the flow type's constructor; the
/// enclosing engine (or the runtime, for top-level flows) drives its hooks.
pub(crate) struct FlowNode {
    ty: Arc<StaticFlowType>,
    open: Option<OpenFlow>,
    idle_state: EngineState,
}

impl FlowNode {
    fn new(ty: Arc<StaticFlowType>) -> Self {
        Self {
            ty,
            open: None,
            idle_state: EngineState::Unopened,
        }
    }

    fn resolve_child_options(
        &self,
        index: usize,
        flow_options: &NodeOptions,
    ) -> Result<NodeOptions> {
        let spec = &self.ty.nodes[index];
        let mut named = spec.options.clone().unwrap_or_default();
        if let Some(setter) = &self.ty.options_setter {
            setter(index, flow_options, &mut named);
        }
        spec.node_type.options_schema().resolve(Some(&named))
    }

    fn unwind_connections(&self, shared: &Arc<FlowShared>, body: &mut FlowBody, made: usize) {
        for conn in self.ty.connections[..made].iter().rev() {
            let mut ctx = shared.child_ctx(conn.spec.dst_node);
            if let Err(err) = body.children[conn.spec.dst_node].node.disconnect_in(
                &mut ctx,
                conn.spec.dst_port,
                conn.in_conn_id,
            ) {
                warn!(flow = self.ty.name(), error = %err, "disconnect_in failed during unwind");
            }
            let mut ctx = shared.child_ctx(conn.spec.src_node);
            if let Err(err) = body.children[conn.spec.src_node].node.disconnect_out(
                &mut ctx,
                conn.spec.src_port,
                conn.out_conn_id,
            ) {
                warn!(flow = self.ty.name(), error = %err, "disconnect_out failed during unwind");
            }
        }
    }

    fn close_children(&self, shared: &Arc<FlowShared>, body: &mut FlowBody, opened: usize) {
        for index in (0..opened).rev() {
            let mut ctx = shared.child_ctx(index);
            body.children[index].node.close(&mut ctx);
        }
        body.children.clear();
    }
}

impl Node for FlowNode {
    fn open(&mut self, ctx: &mut NodeContext, options: &NodeOptions) -> Result<()> {
        if self.open.is_some() {
            return Err(FlowError::Busy(format!(
                "flow '{}' is already open",
                self.ty.name()
            )));
        }

        let shared = FlowShared::new(Arc::clone(&self.ty), ctx.main_loop().clone());
        *shared.uplink.lock() = ctx.outlet().map(|outlet| Uplink {
            outlet,
            node_index: ctx.index(),
        });

        let mut children = Vec::with_capacity(self.ty.nodes.len());
        for spec in &self.ty.nodes {
            children.push(Child {
                name: spec.name.clone(),
                node: spec.node_type.instantiate()?,
            });
        }
        let body = Arc::new(Mutex::new(FlowBody {
            children,
            state: EngineState::Opening,
        }));
        *shared.body.lock() = Arc::downgrade(&body);

        // Children see their index and send capability before any open hook
        // runs; packets emitted from open hooks queue for a later pass.
        let mut opened = 0;
        let mut failure = None;
        for index in 0..self.ty.nodes.len() {
            match self.resolve_child_options(index, options).and_then(|opts| {
                let mut child_ctx = shared.child_ctx(index);
                body.lock().children[index].node.open(&mut child_ctx, &opts)
            }) {
                Ok(()) => opened += 1,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if failure.is_none() {
            let mut made = 0;
            for conn in &self.ty.connections {
                let result = (|| {
                    let mut ctx = shared.child_ctx(conn.spec.src_node);
                    body.lock().children[conn.spec.src_node].node.connect_out(
                        &mut ctx,
                        conn.spec.src_port,
                        conn.out_conn_id,
                    )?;
                    let mut ctx = shared.child_ctx(conn.spec.dst_node);
                    if let Err(err) = body.lock().children[conn.spec.dst_node].node.connect_in(
                        &mut ctx,
                        conn.spec.dst_port,
                        conn.in_conn_id,
                    ) {
                        let mut ctx = shared.child_ctx(conn.spec.src_node);
                        let _ = body.lock().children[conn.spec.src_node].node.disconnect_out(
                            &mut ctx,
                            conn.spec.src_port,
                            conn.out_conn_id,
                        );
                        return Err(err);
                    }
                    Ok(())
                })();
                match result {
                    Ok(()) => made += 1,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            if failure.is_some() {
                let mut guard = body.lock();
                self.unwind_connections(&shared, &mut guard, made);
            }
        }

        if let Some(err) = failure {
            shared.closing.store(true, Ordering::Relaxed);
            if let Some(handle) = shared.dispatcher.lock().take() {
                shared.main_loop.cancel(&handle);
            }
            shared.queue.lock().clear();
            let mut guard = body.lock();
            self.close_children(&shared, &mut guard, opened);
            guard.state = EngineState::Closed;
            self.idle_state = EngineState::Closed;
            return Err(err);
        }

        body.lock().state = EngineState::Connected;
        self.open = Some(OpenFlow { shared, body });
        Ok(())
    }

    fn close(&mut self, _ctx: &mut NodeContext) {
        let Some(open) = self.open.take() else {
            return;
        };
        open.shared.closing.store(true, Ordering::Relaxed);
        if let Some(handle) = open.shared.dispatcher.lock().take() {
            open.shared.main_loop.cancel(&handle);
        }
        let drained = open.shared.queue.lock().len();
        open.shared.queue.lock().clear();
        if drained > 0 {
            debug!(
                flow = self.ty.name(),
                drained, "disposed queued packets on close"
            );
        }

        let mut body = open.body.lock();
        body.state = EngineState::Closing;
        self.unwind_connections(&open.shared, &mut body, self.ty.connections.len());
        let count = body.children.len();
        self.close_children(&open.shared, &mut body, count);
        body.state = EngineState::Closed;
        self.idle_state = EngineState::Closed;
    }

    fn process(
        &mut self,
        _ctx: &mut NodeContext,
        port: PortId,
        conn_id: ConnId,
        packet: &Packet,
    ) -> Result<()> {
        let open = self.open.as_ref().ok_or_else(|| {
            FlowError::InvalidArgument(format!("flow '{}' is not open", self.ty.name()))
        })?;
        let export = self.ty.exported_in.get(port as usize).ok_or_else(|| {
            FlowError::InvalidArgument(format!(
                "flow '{}' has no exported input {}",
                self.ty.name(),
                port
            ))
        })?;
        let mut ctx = open.shared.child_ctx(export.node);
        open.body.lock().children[export.node].node.process(
            &mut ctx,
            export.port,
            export.base_conn_id + conn_id,
            packet,
        )
    }

    fn connect_in(&mut self, _ctx: &mut NodeContext, port: PortId, conn_id: ConnId) -> Result<()> {
        let open = self.open.as_ref().ok_or_else(|| {
            FlowError::InvalidArgument(format!("flow '{}' is not open", self.ty.name()))
        })?;
        let export = self.ty.exported_in.get(port as usize).ok_or_else(|| {
            FlowError::InvalidArgument(format!("no exported input {}", port))
        })?;
        let mut ctx = open.shared.child_ctx(export.node);
        open.body.lock().children[export.node].node.connect_in(
            &mut ctx,
            export.port,
            export.base_conn_id + conn_id,
        )
    }

    fn disconnect_in(
        &mut self,
        _ctx: &mut NodeContext,
        port: PortId,
        conn_id: ConnId,
    ) -> Result<()> {
        let open = self.open.as_ref().ok_or_else(|| {
            FlowError::InvalidArgument(format!("flow '{}' is not open", self.ty.name()))
        })?;
        let export = self.ty.exported_in.get(port as usize).ok_or_else(|| {
            FlowError::InvalidArgument(format!("no exported input {}", port))
        })?;
        let mut ctx = open.shared.child_ctx(export.node);
        open.body.lock().children[export.node].node.disconnect_in(
            &mut ctx,
            export.port,
            export.base_conn_id + conn_id,
        )
    }

    fn connect_out(&mut self, _ctx: &mut NodeContext, port: PortId, conn_id: ConnId) -> Result<()> {
        let open = self.open.as_ref().ok_or_else(|| {
            FlowError::InvalidArgument(format!("flow '{}' is not open", self.ty.name()))
        })?;
        let export = self.ty.exported_out.get(port as usize).ok_or_else(|| {
            FlowError::InvalidArgument(format!("no exported output {}", port))
        })?;
        let mut ctx = open.shared.child_ctx(export.node);
        open.body.lock().children[export.node].node.connect_out(
            &mut ctx,
            export.port,
            export.base_conn_id + conn_id,
        )
    }

    fn disconnect_out(
        &mut self,
        _ctx: &mut NodeContext,
        port: PortId,
        conn_id: ConnId,
    ) -> Result<()> {
        let open = self.open.as_ref().ok_or_else(|| {
            FlowError::InvalidArgument(format!("flow '{}' is not open", self.ty.name()))
        })?;
        let export = self.ty.exported_out.get(port as usize).ok_or_else(|| {
            FlowError::InvalidArgument(format!("no exported output {}", port))
        })?;
        let mut ctx = open.shared.child_ctx(export.node);
        open.body.lock().children[export.node].node.disconnect_out(
            &mut ctx,
            export.port,
            export.base_conn_id + conn_id,
        )
    }

    fn engine_state(&self) -> Option<EngineState> {
        Some(match &self.open {
            Some(open) => open.body.lock().state,
            None => self.idle_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::PacketType;

    struct NullNode;
    impl Node for NullNode {}

    fn emitter_type() -> Arc<NodeType> {
        Arc::new(
            NodeType::new("emitter", || Ok(Box::new(NullNode))).with_out_ports(vec![
                PortDescriptor::new("OUT", PacketType::IRange),
                PortDescriptor::new("ERROR", PacketType::Error),
            ]),
        )
    }

    fn sink_type() -> Arc<NodeType> {
        Arc::new(
            NodeType::new("sink", || Ok(Box::new(NullNode)))
                .with_in_ports(vec![PortDescriptor::new("IN", PacketType::IRange)]),
        )
    }

    fn any_sink_type() -> Arc<NodeType> {
        Arc::new(
            NodeType::new("any-sink", || Ok(Box::new(NullNode)))
                .with_in_ports(vec![PortDescriptor::new("IN", PacketType::Any)]),
        )
    }

    #[test]
    fn test_build_rejects_empty_flow() {
        let builder = StaticFlowBuilder::new("empty");
        assert!(matches!(
            builder.build(),
            Err(FlowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_build_rejects_out_of_range_connection() {
        let mut builder = StaticFlowBuilder::new("bad");
        let a = builder.add_node("a", emitter_type(), None);
        builder.connect(a, 0, 7, 0);
        assert!(matches!(
            builder.build(),
            Err(FlowError::InvalidArgument(_))
        ));

        let mut builder = StaticFlowBuilder::new("bad-port");
        let a = builder.add_node("a", emitter_type(), None);
        let b = builder.add_node("b", sink_type(), None);
        builder.connect(a, 9, b, 0);
        assert!(matches!(
            builder.build(),
            Err(FlowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_build_rejects_unsorted_connections() {
        let mut builder = StaticFlowBuilder::new("unsorted");
        let a = builder.add_node("a", emitter_type(), None);
        let b = builder.add_node("b", emitter_type(), None);
        let s = builder.add_node("s", any_sink_type(), None);
        builder.connect(b, 0, s, 0);
        builder.connect(a, 0, s, 0);
        assert!(matches!(
            builder.build(),
            Err(FlowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_build_rejects_type_mismatch() {
        let boolean_sink = Arc::new(
            NodeType::new("bool-sink", || Ok(Box::new(NullNode)))
                .with_in_ports(vec![PortDescriptor::new("IN", PacketType::Boolean)]),
        );
        let mut builder = StaticFlowBuilder::new("mismatch");
        let a = builder.add_node("a", emitter_type(), None);
        let b = builder.add_node("b", boolean_sink, None);
        builder.connect(a, 0, b, 0);
        assert!(matches!(builder.build(), Err(FlowError::InvalidType(_))));
    }

    #[test]
    fn test_any_matches_on_either_side() {
        let mut builder = StaticFlowBuilder::new("any");
        let a = builder.add_node("a", emitter_type(), None);
        let s = builder.add_node("s", any_sink_type(), None);
        builder.connect(a, 0, s, 0);
        builder.connect(a, 1, s, 0);
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_connection_ids_are_per_port_ordinals() {
        let mut builder = StaticFlowBuilder::new("ids");
        let a = builder.add_node("a", emitter_type(), None);
        let s1 = builder.add_node("s1", any_sink_type(), None);
        let s2 = builder.add_node("s2", any_sink_type(), None);
        builder.connect(a, 0, s1, 0);
        builder.connect(a, 0, s2, 0);
        builder.connect(a, 1, s1, 0);
        let ty = builder.build().unwrap();
        let conns = &ty.connections;
        // Two connections from (a, 0): out ids 0 and 1. One from (a, 1): id 0.
        assert_eq!(conns[0].out_conn_id, 0);
        assert_eq!(conns[1].out_conn_id, 1);
        assert_eq!(conns[2].out_conn_id, 0);
        // s1's input receives connection 0 and 2: in ids 0 and 1.
        assert_eq!(conns[0].in_conn_id, 0);
        assert_eq!(conns[1].in_conn_id, 0);
        assert_eq!(conns[2].in_conn_id, 1);
    }

    #[test]
    fn test_first_conn_index() {
        let mut builder = StaticFlowBuilder::new("first");
        let a = builder.add_node("a", emitter_type(), None);
        let b = builder.add_node("b", emitter_type(), None);
        let s = builder.add_node("s", any_sink_type(), None);
        builder.connect(a, 0, s, 0);
        builder.connect(b, 0, s, 0);
        builder.connect(b, 1, s, 0);
        let ty = builder.build().unwrap();
        assert_eq!(ty.node_infos[a].first_conn, 0);
        assert_eq!(ty.node_infos[b].first_conn, 1);
        assert_eq!(ty.node_infos[s].first_conn, ty.connections.len());
    }

    #[test]
    fn test_exported_ports_must_be_sorted() {
        let mut builder = StaticFlowBuilder::new("exports");
        let a = builder.add_node("a", emitter_type(), None);
        builder.export_out(a, 1).export_out(a, 0);
        assert!(matches!(
            builder.build(),
            Err(FlowError::InvalidArgument(_))
        ));

        let mut builder = StaticFlowBuilder::new("exports-dup");
        let a = builder.add_node("a", emitter_type(), None);
        builder.export_out(a, 0).export_out(a, 0);
        assert!(matches!(
            builder.build(),
            Err(FlowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_exported_base_conn_id_counts_internal_connections() {
        let mut builder = StaticFlowBuilder::new("bias");
        let a = builder.add_node("a", emitter_type(), None);
        let s = builder.add_node("s", any_sink_type(), None);
        builder.connect(a, 0, s, 0);
        builder.export_out(a, 0);
        builder.export_in(s, 0);
        let ty = builder.build().unwrap();
        assert_eq!(ty.exported_out[0].base_conn_id, 1);
        assert_eq!(ty.exported_in[0].base_conn_id, 1);
    }

    #[test]
    fn test_flow_as_node_type_exposes_exported_ports() {
        let mut builder = StaticFlowBuilder::new("subflow");
        let a = builder.add_node("a", emitter_type(), None);
        let s = builder.add_node("s", sink_type(), None);
        builder.export_out(a, 0);
        builder.export_in(s, 0);
        let ty = builder.build().unwrap();
        let node_type = ty.as_node_type();
        assert_eq!(node_type.in_ports().len(), 1);
        assert_eq!(node_type.out_ports().len(), 1);
        assert_eq!(node_type.out_ports()[0].name, "OUT");
        assert_eq!(node_type.in_ports()[0].name, "IN");
    }
}
