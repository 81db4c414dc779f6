//! Composed packet types
//!
//! A composed type aggregates an ordered list of member types into one
//! atomic packet. Identity is structural: requesting a composed type twice
//! with the same member list yields the same interned descriptor, so type
//! equality stays a cheap comparison even for manufactured types.

use super::super::error::{FlowError, Result};
use super::PacketType;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

struct ComposedTypeInner {
    name: String,
    members: Vec<PacketType>,
}

/// Interned descriptor of a composed packet type.
#[derive(Clone)]
pub struct ComposedType {
    inner: Arc<ComposedTypeInner>,
}

impl ComposedType {
    fn new(members: Vec<PacketType>) -> Self {
        let name = format!(
            "composed:{}",
            members
                .iter()
                .map(|m| m.name().to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
        Self {
            inner: Arc::new(ComposedTypeInner { name, members }),
        }
    }

    /// Deterministic name derived from the member list,
    /// e.g. `composed:irange,string,boolean`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn members(&self) -> &[PacketType] {
        &self.inner.members
    }

    pub fn member_count(&self) -> usize {
        self.inner.members.len()
    }

    /// True when both handles point at the same interned descriptor.
    pub fn ptr_eq(&self, other: &ComposedType) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for ComposedType {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.inner.members == other.inner.members
    }
}

impl Eq for ComposedType {}

impl fmt::Debug for ComposedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedType")
            .field("name", &self.inner.name)
            .finish()
    }
}

/// Interning table for composed types.
///
/// Runtime-scoped, not process-wide: the host constructs one through
/// [`crate::FlowRuntime`] and `shutdown()` clears it.
#[derive(Clone, Default)]
pub struct ComposedTypeRegistry {
    types: Arc<Mutex<Vec<ComposedType>>>,
}

impl ComposedTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or construct the composed type over `members`.
    ///
    /// The member list must be non-empty and every member must be able to
    /// instantiate packets (`Any` is rejected).
    pub fn composed_type(&self, members: &[PacketType]) -> Result<ComposedType> {
        if members.is_empty() {
            return Err(FlowError::InvalidArgument(
                "composed type needs at least one member".into(),
            ));
        }
        if let Some(bad) = members.iter().find(|m| !m.can_instantiate()) {
            return Err(FlowError::InvalidType(format!(
                "composed member type {} cannot instantiate packets",
                bad
            )));
        }
        let mut types = self.types.lock();
        if let Some(existing) = types.iter().find(|ct| ct.members() == members) {
            return Ok(existing.clone());
        }
        let created = ComposedType::new(members.to_vec());
        types.push(created.clone());
        Ok(created)
    }

    pub fn len(&self) -> usize {
        self.types.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.lock().is_empty()
    }

    pub(crate) fn clear(&self) {
        self.types.lock().clear();
    }
}
