//! Flow runtime
//!
//! The host constructs one `FlowRuntime` and registers everything into it:
//! flows open against its main loop, composed types intern in its table,
//! memory maps live in its storage registry. Nothing in the crate is
//! process-wide; two runtimes in one process do not share state.

use super::error::Result;
use super::flow::{EngineState, NamedOptions, NodeContext, NodeType, PortId};
use super::packet::{ComposedTypeRegistry, Packet};
use super::scheduling::MainLoop;
use super::storage::Storage;
use std::sync::Arc;
use tracing::debug;

pub struct FlowRuntime {
    main_loop: MainLoop,
    composed_types: ComposedTypeRegistry,
    storage: Storage,
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowRuntime {
    pub fn new() -> Self {
        let main_loop = MainLoop::new();
        Self {
            composed_types: ComposedTypeRegistry::new(),
            storage: Storage::new(main_loop.clone()),
            main_loop,
        }
    }

    pub fn main_loop(&self) -> &MainLoop {
        &self.main_loop
    }

    pub fn composed_types(&self) -> &ComposedTypeRegistry {
        &self.composed_types
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Instantiate and open a top-level node — usually a flow type from
    /// [`crate::StaticFlowType::as_node_type`]. The node's exported outputs
    /// have no parent and are dropped when they fire.
    pub fn open_flow(
        &self,
        node_type: &Arc<NodeType>,
        options: Option<&NamedOptions>,
    ) -> Result<FlowHandle> {
        let resolved = node_type.options_schema().resolve(options)?;
        let mut node = node_type.instantiate()?;
        let mut ctx = NodeContext::root(self.main_loop.clone());
        node.open(&mut ctx, &resolved)?;
        debug!(flow = node_type.name(), "flow opened");
        Ok(FlowHandle {
            node_type: Arc::clone(node_type),
            node,
            open: true,
            main_loop: self.main_loop.clone(),
        })
    }

    /// Drain pending storage writes and clear the composed-type table.
    /// Open flows are owned by their handles and close independently.
    pub fn shutdown(&self) -> Result<()> {
        self.storage.remove_all()?;
        self.composed_types.clear();
        Ok(())
    }
}

impl std::fmt::Debug for FlowRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRuntime")
            .field("main_loop", &self.main_loop)
            .field("storage", &self.storage)
            .finish()
    }
}

/// Owning handle of one opened top-level node. Dropping the handle closes
/// the node.
pub struct FlowHandle {
    node_type: Arc<NodeType>,
    node: Box<dyn super::flow::Node>,
    open: bool,
    main_loop: MainLoop,
}

impl std::fmt::Debug for FlowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowHandle")
            .field("node_type", &self.node_type.name())
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl FlowHandle {
    pub fn node_type(&self) -> &Arc<NodeType> {
        &self.node_type
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Container nodes report their engine state, including `Closed` after
    /// [`FlowHandle::close`]; leaf nodes report nothing.
    pub fn engine_state(&self) -> Option<EngineState> {
        self.node.engine_state()
    }

    /// Inject a packet into one of the node's input ports, as if delivered
    /// over a single host-side connection (connection id 0).
    pub fn process_in(&mut self, port: PortId, packet: &Packet) -> Result<()> {
        if !self.open {
            return Err(super::error::FlowError::InvalidArgument(format!(
                "flow '{}' is closed",
                self.node_type.name()
            )));
        }
        let mut ctx = NodeContext::root(self.main_loop.clone());
        self.node.process(&mut ctx, port, 0, packet)
    }

    /// Inject by port name.
    pub fn process_in_named(&mut self, port: &str, packet: &Packet) -> Result<()> {
        let id = self.node_type.find_in_port(port).ok_or_else(|| {
            super::error::FlowError::NotFound(format!(
                "input port '{}' on flow '{}'",
                port,
                self.node_type.name()
            ))
        })?;
        self.process_in(id, packet)
    }

    pub fn close(&mut self) {
        if self.open {
            self.open = false;
            let mut ctx = NodeContext::root(self.main_loop.clone());
            self.node.close(&mut ctx);
            debug!(flow = self.node_type.name(), "flow closed");
        }
    }
}

impl Drop for FlowHandle {
    fn drop(&mut self) {
        self.close();
    }
}
