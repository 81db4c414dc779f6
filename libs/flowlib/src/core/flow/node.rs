//! Nodes and node types
//!
//! A `NodeType` is a runtime descriptor: named, typed ports, an option
//! schema, and a constructor producing boxed [`Node`] instances. Types are
//! plain values — leaf nodes ship them as statics or factory functions, and
//! the engine manufactures them for flows and composed meta-nodes.
//!
//! Node implementations override only the hooks they care about; every hook
//! defaults to a no-op.

use super::super::error::{FlowError, Result};
use super::super::packet::{Packet, PacketType};
use super::context::NodeContext;
use serde::de::DeserializeOwned;
use std::fmt;

/// Index of a port within a node type's input or output list.
pub type PortId = u16;

/// Stable ordinal of a connection among those sharing one (node, port)
/// endpoint. The kth connection on a port gets id k-1.
pub type ConnId = u16;

/// A named, typed port.
#[derive(Debug, Clone)]
pub struct PortDescriptor {
    pub name: String,
    pub packet_type: PacketType,
    pub description: String,
}

impl PortDescriptor {
    pub fn new(name: impl Into<String>, packet_type: PacketType) -> Self {
        Self {
            name: name.into(),
            packet_type,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// One option in a node type's schema. `default: None` marks the option as
/// required.
#[derive(Debug, Clone)]
pub struct OptionSpec {
    pub name: String,
    pub default: Option<serde_json::Value>,
}

impl OptionSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn with_default(name: impl Into<String>, default: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
        }
    }
}

/// User-supplied named-options table, as parsed from a flow description.
pub type NamedOptions = serde_json::Map<String, serde_json::Value>;

/// Option schema a node type declares. Resolution checks a named table
/// against it and produces the [`NodeOptions`] handed to the open hook.
#[derive(Debug, Clone, Default)]
pub struct OptionsSchema {
    specs: Vec<OptionSpec>,
}

impl OptionsSchema {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(specs: Vec<OptionSpec>) -> Self {
        Self { specs }
    }

    pub fn specs(&self) -> &[OptionSpec] {
        &self.specs
    }

    /// Build options from `given`: unknown names are rejected, defaults fill
    /// the gaps, and a missing option without a default is an error.
    pub fn resolve(&self, given: Option<&NamedOptions>) -> Result<NodeOptions> {
        let empty = NamedOptions::new();
        let given = given.unwrap_or(&empty);
        if let Some(unknown) = given.keys().find(|k| !self.specs.iter().any(|s| &s.name == *k)) {
            return Err(FlowError::InvalidArgument(format!(
                "unknown option '{}'",
                unknown
            )));
        }
        let mut values = NamedOptions::new();
        for spec in &self.specs {
            match given.get(&spec.name).cloned().or_else(|| spec.default.clone()) {
                Some(value) => {
                    values.insert(spec.name.clone(), value);
                }
                None => {
                    return Err(FlowError::InvalidArgument(format!(
                        "missing required option '{}'",
                        spec.name
                    )));
                }
            }
        }
        Ok(NodeOptions { values })
    }
}

/// Resolved options for one node instance.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    values: NamedOptions,
}

impl NodeOptions {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.values.get(name)
    }

    pub fn values(&self) -> &NamedOptions {
        &self.values
    }

    /// Deserialize the whole table into a typed config struct.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.values.clone()))
            .map_err(|err| FlowError::InvalidArgument(format!("bad options: {}", err)))
    }
}

/// A node instance inside an enclosing flow.
///
/// Hooks run on the main-loop thread. `process` receives the original packet;
/// implementations that retain it must `duplicate()`.
pub trait Node: Send + 'static {
    fn open(&mut self, ctx: &mut NodeContext, options: &NodeOptions) -> Result<()> {
        let _ = (ctx, options);
        Ok(())
    }

    fn close(&mut self, ctx: &mut NodeContext) {
        let _ = ctx;
    }

    fn process(
        &mut self,
        ctx: &mut NodeContext,
        port: PortId,
        conn_id: ConnId,
        packet: &Packet,
    ) -> Result<()> {
        let _ = (ctx, port, conn_id, packet);
        Ok(())
    }

    fn connect_in(&mut self, ctx: &mut NodeContext, port: PortId, conn_id: ConnId) -> Result<()> {
        let _ = (ctx, port, conn_id);
        Ok(())
    }

    fn disconnect_in(
        &mut self,
        ctx: &mut NodeContext,
        port: PortId,
        conn_id: ConnId,
    ) -> Result<()> {
        let _ = (ctx, port, conn_id);
        Ok(())
    }

    fn connect_out(&mut self, ctx: &mut NodeContext, port: PortId, conn_id: ConnId) -> Result<()> {
        let _ = (ctx, port, conn_id);
        Ok(())
    }

    fn disconnect_out(
        &mut self,
        ctx: &mut NodeContext,
        port: PortId,
        conn_id: ConnId,
    ) -> Result<()> {
        let _ = (ctx, port, conn_id);
        Ok(())
    }

    /// Container nodes report their engine state; leaves report nothing.
    fn engine_state(&self) -> Option<super::static_flow::EngineState> {
        None
    }
}

type Constructor = Box<dyn Fn() -> Result<Box<dyn Node>> + Send + Sync>;

/// Runtime descriptor of a node type. Immutable once constructed.
pub struct NodeType {
    name: String,
    in_ports: Vec<PortDescriptor>,
    out_ports: Vec<PortDescriptor>,
    options: OptionsSchema,
    constructor: Constructor,
    #[cfg(feature = "descriptions")]
    description: Option<String>,
}

impl NodeType {
    pub fn new(
        name: impl Into<String>,
        constructor: impl Fn() -> Result<Box<dyn Node>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            in_ports: Vec::new(),
            out_ports: Vec::new(),
            options: OptionsSchema::empty(),
            constructor: Box::new(constructor),
            #[cfg(feature = "descriptions")]
            description: None,
        }
    }

    pub fn with_in_ports(mut self, ports: Vec<PortDescriptor>) -> Self {
        self.in_ports = ports;
        self
    }

    pub fn with_out_ports(mut self, ports: Vec<PortDescriptor>) -> Self {
        self.out_ports = ports;
        self
    }

    pub fn with_options(mut self, options: OptionsSchema) -> Self {
        self.options = options;
        self
    }

    /// Attach a human-readable description. Compiled out (and ignored)
    /// without the `descriptions` feature.
    #[allow(unused_variables, unused_mut)]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        #[cfg(feature = "descriptions")]
        {
            self.description = Some(description.into());
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_ports(&self) -> &[PortDescriptor] {
        &self.in_ports
    }

    pub fn out_ports(&self) -> &[PortDescriptor] {
        &self.out_ports
    }

    pub fn options_schema(&self) -> &OptionsSchema {
        &self.options
    }

    pub fn description(&self) -> Option<&str> {
        #[cfg(feature = "descriptions")]
        {
            self.description.as_deref()
        }
        #[cfg(not(feature = "descriptions"))]
        {
            None
        }
    }

    pub fn find_in_port(&self, name: &str) -> Option<PortId> {
        self.in_ports
            .iter()
            .position(|p| p.name == name)
            .map(|idx| idx as PortId)
    }

    pub fn find_out_port(&self, name: &str) -> Option<PortId> {
        self.out_ports
            .iter()
            .position(|p| p.name == name)
            .map(|idx| idx as PortId)
    }

    /// Create an unopened instance. The engine runs the open hook.
    pub fn instantiate(&self) -> Result<Box<dyn Node>> {
        (self.constructor)()
    }
}

impl fmt::Debug for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeType")
            .field("name", &self.name)
            .field("in_ports", &self.in_ports.len())
            .field("out_ports", &self.out_ports.len())
            .finish()
    }
}
