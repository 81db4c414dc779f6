//! Flow engine: nodes, contexts, static flows, composed meta-nodes.

pub mod composed_node;
pub mod context;
pub mod node;
pub mod static_flow;

pub use composed_node::{constructor_node_type, parse_port_schema, splitter_node_type};
pub use context::NodeContext;
pub use node::{
    ConnId, NamedOptions, Node, NodeOptions, NodeType, OptionSpec, OptionsSchema, PortDescriptor,
    PortId,
};
pub use static_flow::{
    ChildOptionsSetter, ConnectionSpec, EngineState, ExportedPortSpec, NodeSpec,
    StaticFlowBuilder, StaticFlowType,
};
