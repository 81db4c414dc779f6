//! Per-node runtime context
//!
//! Every node hook receives a `NodeContext` built by the enclosing engine.
//! It carries the node's parent-assigned index, the shared main loop, and
//! the send capability routed to the enclosing flow's queue — nodes never
//! hold a back-reference to their parent.

use super::super::error::Result;
use super::super::packet::Packet;
use super::super::scheduling::MainLoop;
use super::node::PortId;
use std::sync::Arc;

/// Engine-side sink for packets emitted by child nodes. Implemented by the
/// flow engine; top-level contexts have none.
pub(crate) trait PacketOutlet: Send + Sync {
    fn send_from(&self, node_index: usize, port: PortId, packet: Packet) -> Result<()>;
}

pub struct NodeContext {
    index: usize,
    main_loop: MainLoop,
    outlet: Option<Arc<dyn PacketOutlet>>,
}

impl NodeContext {
    pub(crate) fn new(
        index: usize,
        main_loop: MainLoop,
        outlet: Option<Arc<dyn PacketOutlet>>,
    ) -> Self {
        Self {
            index,
            main_loop,
            outlet,
        }
    }

    /// Context for a node opened directly by the host, outside any flow.
    pub(crate) fn root(main_loop: MainLoop) -> Self {
        Self::new(0, main_loop, None)
    }

    /// The node's index within its enclosing flow.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn main_loop(&self) -> &MainLoop {
        &self.main_loop
    }

    pub(crate) fn outlet(&self) -> Option<Arc<dyn PacketOutlet>> {
        self.outlet.clone()
    }

    /// Emit `packet` on the node's output `port`.
    ///
    /// Validates the port index and the packet/port type match, then hands
    /// the packet to the enclosing flow's send queue; delivery happens on a
    /// later dispatch pass. Without an enclosing flow the packet is dropped.
    pub fn send(&mut self, port: PortId, packet: Packet) -> Result<()> {
        match &self.outlet {
            Some(outlet) => outlet.send_from(self.index, port, packet),
            None => {
                tracing::debug!(
                    port,
                    ty = packet.packet_type().name(),
                    "packet sent outside any flow, dropped"
                );
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("index", &self.index)
            .field("routed", &self.outlet.is_some())
            .finish()
    }
}
