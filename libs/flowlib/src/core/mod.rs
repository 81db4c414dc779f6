
pub mod blob;
pub mod error;
pub mod flow;
pub mod packet;
pub mod runtime;
pub mod scheduling;
pub mod storage;

pub use blob::Blob;
pub use error::{FlowError, Result};
pub use flow::{
    constructor_node_type, parse_port_schema, splitter_node_type, ChildOptionsSetter, ConnId,
    ConnectionSpec, EngineState, ExportedPortSpec, NamedOptions, Node, NodeContext, NodeOptions,
    NodeSpec, NodeType, OptionSpec, OptionsSchema, PortDescriptor, PortId, StaticFlowBuilder,
    StaticFlowType,
};
pub use packet::{
    ComposedType, ComposedTypeRegistry, DirectionVector, FloatRange, HttpResponseValue, IntRange,
    Location, Packet, PacketType, PacketValue, Rgb,
};
pub use runtime::{FlowHandle, FlowRuntime};
pub use scheduling::{MainLoop, TimerHandle};
pub use storage::{I2cResolver, MapEntry, MemMap, Storage, WriteCallback, VERSION_ENTRY};
