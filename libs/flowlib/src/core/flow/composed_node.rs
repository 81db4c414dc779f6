//! Composed meta-node
//!
//! Manufactures node types from a textual port schema of the form
//! `name1(type1) | name2(type2) | …`. The constructor variant aggregates N
//! typed inputs into one composed packet on `OUT`; the splitter variant
//! breaks a composed packet from `IN` into N typed outputs. Both are
//! ordinary node types from the engine's perspective.

use super::super::error::{FlowError, Result};
use super::super::packet::{ComposedType, ComposedTypeRegistry, Packet, PacketType};
use super::context::NodeContext;
use super::node::{ConnId, Node, NodeType, PortDescriptor, PortId};
use std::sync::Arc;

/// Parse a port schema: whitespace is stripped, tokens are `|`-delimited,
/// each token is `name(tag)` with a built-in packet-type tag. At least two
/// tokens are required.
pub fn parse_port_schema(decl: &str) -> Result<Vec<(String, PacketType)>> {
    let stripped: String = decl.chars().filter(|c| !c.is_whitespace()).collect();
    if stripped.is_empty() {
        return Err(FlowError::InvalidArgument("empty port schema".into()));
    }
    let mut ports = Vec::new();
    for token in stripped.split('|') {
        let open = token.find('(').ok_or_else(|| {
            FlowError::InvalidArgument(format!("malformed port token '{}'", token))
        })?;
        if !token.ends_with(')') || open == 0 || open + 2 > token.len() {
            return Err(FlowError::InvalidArgument(format!(
                "malformed port token '{}'",
                token
            )));
        }
        let name = &token[..open];
        let tag = &token[open + 1..token.len() - 1];
        let packet_type = PacketType::from_tag(tag).ok_or_else(|| {
            FlowError::InvalidType(format!("unknown packet type tag '{}'", tag))
        })?;
        ports.push((name.to_string(), packet_type));
    }
    if ports.len() < 2 {
        return Err(FlowError::InvalidArgument(
            "a composed schema needs at least two ports".into(),
        ));
    }
    Ok(ports)
}

struct ConstructorNode {
    composed: ComposedType,
    slots: Vec<Option<Packet>>,
}

impl Node for ConstructorNode {
    fn process(
        &mut self,
        ctx: &mut NodeContext,
        port: PortId,
        _conn_id: ConnId,
        packet: &Packet,
    ) -> Result<()> {
        let slot = self.slots.get_mut(port as usize).ok_or_else(|| {
            FlowError::InvalidArgument(format!("no member slot for port {}", port))
        })?;
        // Overwriting disposes the previous occupant; slots persist across
        // emissions, so later single-port updates re-emit a full packet.
        *slot = Some(packet.duplicate());
        if self.slots.iter().all(Option::is_some) {
            let members: Vec<Packet> = self.slots.iter().flatten().cloned().collect();
            let composed = Packet::composed(&self.composed, members)?;
            ctx.send(0, composed)?;
        }
        Ok(())
    }
}

struct SplitterNode {
    member_count: usize,
}

impl Node for SplitterNode {
    fn process(
        &mut self,
        ctx: &mut NodeContext,
        _port: PortId,
        _conn_id: ConnId,
        packet: &Packet,
    ) -> Result<()> {
        let (_ty, members) = packet.composed_members()?;
        if members.len() != self.member_count {
            return Err(FlowError::InvalidType(format!(
                "composed packet has {} members, splitter expects {}",
                members.len(),
                self.member_count
            )));
        }
        let members: Vec<Packet> = members.iter().map(Packet::duplicate).collect();
        for (index, member) in members.into_iter().enumerate() {
            ctx.send(index as PortId, member)?;
        }
        Ok(())
    }
}

#[cfg(feature = "descriptions")]
fn describe_ports(ports: &[(String, PacketType)]) -> String {
    ports
        .iter()
        .map(|(name, ty)| format!("{}({})", name, ty.name()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Node type with N typed inputs and one composed `OUT` output.
///
/// The composed output type is interned in `registry`; two constructors over
/// the same schema share it.
pub fn constructor_node_type(
    registry: &ComposedTypeRegistry,
    decl: &str,
) -> Result<Arc<NodeType>> {
    let ports = parse_port_schema(decl)?;
    let members: Vec<PacketType> = ports.iter().map(|(_, ty)| ty.clone()).collect();
    let composed = registry.composed_type(&members)?;

    let slot_count = ports.len();
    let node_composed = composed.clone();
    let ty = NodeType::new(format!("composed-new:{}", composed.name()), move || {
        Ok(Box::new(ConstructorNode {
            composed: node_composed.clone(),
            slots: vec![None; slot_count],
        }) as Box<dyn Node>)
    })
    .with_in_ports(
        ports
            .iter()
            .map(|(name, ty)| PortDescriptor::new(name, ty.clone()))
            .collect(),
    )
    .with_out_ports(vec![PortDescriptor::new(
        "OUT",
        PacketType::Composed(composed),
    )]);

    #[cfg(feature = "descriptions")]
    let ty = ty.with_description(format!(
        "Aggregates inputs {} into one composed packet on OUT",
        describe_ports(&ports)
    ));

    Ok(Arc::new(ty))
}

/// Node type with one composed `IN` input and N typed outputs.
///
/// The member list derives from the declared outputs; the input type is the
/// interned composed type over them.
pub fn splitter_node_type(registry: &ComposedTypeRegistry, decl: &str) -> Result<Arc<NodeType>> {
    let ports = parse_port_schema(decl)?;
    let members: Vec<PacketType> = ports.iter().map(|(_, ty)| ty.clone()).collect();
    let composed = registry.composed_type(&members)?;

    let member_count = ports.len();
    let ty = NodeType::new(format!("composed-split:{}", composed.name()), move || {
        Ok(Box::new(SplitterNode { member_count }) as Box<dyn Node>)
    })
    .with_in_ports(vec![PortDescriptor::new(
        "IN",
        PacketType::Composed(composed),
    )])
    .with_out_ports(
        ports
            .iter()
            .map(|(name, ty)| PortDescriptor::new(name, ty.clone()))
            .collect(),
    );

    #[cfg(feature = "descriptions")]
    let ty = ty.with_description(format!(
        "Splits a composed packet from IN into outputs {}",
        describe_ports(&ports)
    ));

    Ok(Arc::new(ty))
}
