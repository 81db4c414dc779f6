
pub mod core;

pub use core::{
    constructor_node_type, parse_port_schema, splitter_node_type,
    Blob, ChildOptionsSetter, ComposedType, ComposedTypeRegistry, ConnId, ConnectionSpec,
    DirectionVector, EngineState, ExportedPortSpec, FloatRange, FlowError, FlowHandle,
    FlowRuntime, HttpResponseValue, I2cResolver, IntRange, Location, MainLoop, MapEntry, MemMap,
    NamedOptions, Node, NodeContext, NodeOptions, NodeSpec, NodeType, OptionSpec, OptionsSchema,
    Packet, PacketType, PacketValue, PortDescriptor, PortId, Result, Rgb, StaticFlowBuilder,
    StaticFlowType, Storage, TimerHandle, WriteCallback, VERSION_ENTRY,
};

/// Opt-in tracing bootstrap for hosts and tests. Filtering follows
/// `RUST_LOG`; repeated calls are harmless.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
