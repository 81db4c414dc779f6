//! Packet type system
//!
//! Packets are the values that flow between node ports. The type set is
//! closed: a `PacketType` is one of the built-in variants below or a
//! `Composed` descriptor manufactured at runtime (see [`composed`]).
//!
//! A `Packet` is an immutable, internally shared instance of exactly one
//! type. `duplicate()` bumps a refcount instead of copying payloads, so
//! blob-bearing packets share their buffer and composed packets share their
//! members. The empty packet and the two boolean packets are interned
//! singletons and are never freed.

pub mod composed;

pub use composed::{ComposedType, ComposedTypeRegistry};

use super::blob::Blob;
use super::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

/// Signed 32-bit value with range metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntRange {
    pub val: i32,
    pub min: i32,
    pub max: i32,
    pub step: i32,
}

impl IntRange {
    pub fn value(val: i32) -> Self {
        Self { val, ..Self::default() }
    }
}

impl Default for IntRange {
    fn default() -> Self {
        Self {
            val: 0,
            min: i32::MIN,
            max: i32::MAX,
            step: 1,
        }
    }
}

/// Floating-point value with range metadata.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloatRange {
    pub val: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl FloatRange {
    pub fn value(val: f64) -> Self {
        Self { val, ..Self::default() }
    }
}

impl Default for FloatRange {
    fn default() -> Self {
        Self {
            val: 0.0,
            min: f64::MIN,
            max: f64::MAX,
            step: f64::MIN_POSITIVE,
        }
    }
}

/// RGB color with per-channel maximums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub red: u32,
    pub green: u32,
    pub blue: u32,
    pub red_max: u32,
    pub green_max: u32,
    pub blue_max: u32,
}

impl Default for Rgb {
    fn default() -> Self {
        Self {
            red: 0,
            green: 0,
            blue: 0,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
        }
    }
}

/// 3-vector with shared component bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DirectionVector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for DirectionVector {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            min: f64::MIN,
            max: f64::MAX,
        }
    }
}

/// Geographic location.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

/// HTTP response payload. Scalar fields and the parameter vectors are owned
/// copies; the body is shared by blob refcount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseValue {
    pub response_code: u16,
    pub url: String,
    pub content_type: String,
    pub cookies: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub content: Blob,
}

impl HttpResponseValue {
    pub fn new(
        response_code: u16,
        url: &str,
        content_type: &str,
        cookies: &[(String, String)],
        headers: &[(String, String)],
        content: Blob,
    ) -> Self {
        Self {
            response_code,
            url: url.to_string(),
            content_type: content_type.to_string(),
            cookies: cookies.to_vec(),
            headers: headers.to_vec(),
            content,
        }
    }
}

/// Descriptor of a packet type.
///
/// `Any` matches every other type during connection and send validation but
/// can never instantiate packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketType {
    Empty,
    Boolean,
    Byte,
    IRange,
    DRange,
    String,
    Blob,
    JsonObject,
    JsonArray,
    Rgb,
    DirectionVector,
    Location,
    Timestamp,
    Error,
    HttpResponse,
    Any,
    Composed(ComposedType),
}

impl PacketType {
    /// Canonical type name, e.g. `"irange"` or `"composed:irange,string"`.
    pub fn name(&self) -> &str {
        match self {
            PacketType::Empty => "empty",
            PacketType::Boolean => "boolean",
            PacketType::Byte => "byte",
            PacketType::IRange => "irange",
            PacketType::DRange => "drange",
            PacketType::String => "string",
            PacketType::Blob => "blob",
            PacketType::JsonObject => "json-object",
            PacketType::JsonArray => "json-array",
            PacketType::Rgb => "rgb",
            PacketType::DirectionVector => "direction-vector",
            PacketType::Location => "location",
            PacketType::Timestamp => "timestamp",
            PacketType::Error => "error",
            PacketType::HttpResponse => "http-response",
            PacketType::Any => "any",
            PacketType::Composed(ct) => ct.name(),
        }
    }

    /// Port-schema tag for this type, when one exists.
    ///
    /// The tag set is the one code generators use; `Empty`, `Any` and
    /// composed types have no tag. Note the historical quirk: the
    /// `http-request` tag names the HTTP *response* type.
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            PacketType::Boolean => Some("boolean"),
            PacketType::Byte => Some("byte"),
            PacketType::IRange => Some("int"),
            PacketType::DRange => Some("float"),
            PacketType::String => Some("string"),
            PacketType::Blob => Some("blob"),
            PacketType::JsonObject => Some("json-object"),
            PacketType::JsonArray => Some("json-array"),
            PacketType::Rgb => Some("rgb"),
            PacketType::DirectionVector => Some("direction-vector"),
            PacketType::Location => Some("location"),
            PacketType::Timestamp => Some("timestamp"),
            PacketType::Error => Some("error"),
            PacketType::HttpResponse => Some("http-request"),
            PacketType::Empty | PacketType::Any | PacketType::Composed(_) => None,
        }
    }

    /// Resolve a port-schema tag back to its type.
    pub fn from_tag(tag: &str) -> Option<PacketType> {
        match tag {
            "boolean" => Some(PacketType::Boolean),
            "byte" => Some(PacketType::Byte),
            "int" => Some(PacketType::IRange),
            "float" => Some(PacketType::DRange),
            "string" => Some(PacketType::String),
            "blob" => Some(PacketType::Blob),
            "json-object" => Some(PacketType::JsonObject),
            "json-array" => Some(PacketType::JsonArray),
            "rgb" => Some(PacketType::Rgb),
            "location" => Some(PacketType::Location),
            "timestamp" => Some(PacketType::Timestamp),
            "direction-vector" => Some(PacketType::DirectionVector),
            "error" => Some(PacketType::Error),
            "http-request" => Some(PacketType::HttpResponse),
            _ => None,
        }
    }

    /// Connection/send compatibility: equal types match, and `Any` matches
    /// everything on either side.
    pub fn matches(&self, other: &PacketType) -> bool {
        matches!(self, PacketType::Any) || matches!(other, PacketType::Any) || self == other
    }

    /// `Any` is a wildcard for validation only and cannot back packets.
    pub fn can_instantiate(&self) -> bool {
        !matches!(self, PacketType::Any)
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Type-tagged payload for the uniform [`Packet::create`] factory.
#[derive(Debug, Clone)]
pub enum PacketValue {
    Empty,
    Boolean(bool),
    Byte(u8),
    IRange(IntRange),
    DRange(FloatRange),
    String(String),
    Blob(Blob),
    JsonObject(Blob),
    JsonArray(Blob),
    Rgb(Rgb),
    DirectionVector(DirectionVector),
    Location(Location),
    Timestamp(SystemTime),
    Error { code: i32, msg: Option<String> },
    HttpResponse(HttpResponseValue),
    Composed(Vec<Packet>),
}

#[derive(Debug)]
enum PacketData {
    Empty,
    Boolean(bool),
    Byte(u8),
    IRange(IntRange),
    DRange(FloatRange),
    String(String),
    Blob(Blob),
    JsonObject(Blob),
    JsonArray(Blob),
    Rgb(Rgb),
    DirectionVector(DirectionVector),
    Location(Location),
    Timestamp(SystemTime),
    Error { code: i32, msg: Option<String> },
    HttpResponse(HttpResponseValue),
    Composed { ty: ComposedType, members: Vec<Packet> },
}

/// An instance of exactly one packet type.
///
/// Cloning (aka *duplicate*) shares the payload cell; payloads are
/// immutable, so sharing is not observable except through refcounts.
#[derive(Clone)]
pub struct Packet {
    data: Arc<PacketData>,
}

static EMPTY_PACKET: OnceLock<Packet> = OnceLock::new();
static TRUE_PACKET: OnceLock<Packet> = OnceLock::new();
static FALSE_PACKET: OnceLock<Packet> = OnceLock::new();

impl Packet {
    fn from_data(data: PacketData) -> Self {
        Self { data: Arc::new(data) }
    }

    /// The interned empty packet. Every call returns the same instance.
    pub fn empty() -> Packet {
        EMPTY_PACKET
            .get_or_init(|| Packet::from_data(PacketData::Empty))
            .clone()
    }

    /// One of the two interned boolean packets, keyed by value.
    pub fn boolean(value: bool) -> Packet {
        let cell = if value { &TRUE_PACKET } else { &FALSE_PACKET };
        cell.get_or_init(|| Packet::from_data(PacketData::Boolean(value)))
            .clone()
    }

    pub fn byte(value: u8) -> Packet {
        Packet::from_data(PacketData::Byte(value))
    }

    pub fn irange(value: IntRange) -> Packet {
        Packet::from_data(PacketData::IRange(value))
    }

    pub fn irange_value(val: i32) -> Packet {
        Packet::irange(IntRange::value(val))
    }

    pub fn drange(value: FloatRange) -> Packet {
        Packet::from_data(PacketData::DRange(value))
    }

    pub fn drange_value(val: f64) -> Packet {
        Packet::drange(FloatRange::value(val))
    }

    pub fn string(value: impl Into<String>) -> Packet {
        Packet::from_data(PacketData::String(value.into()))
    }

    pub fn blob(value: Blob) -> Packet {
        Packet::from_data(PacketData::Blob(value))
    }

    /// JSON object packet. The blob must parse as a JSON object.
    pub fn json_object(value: Blob) -> Result<Packet> {
        match serde_json::from_slice::<serde_json::Value>(value.as_slice()) {
            Ok(serde_json::Value::Object(_)) => {
                Ok(Packet::from_data(PacketData::JsonObject(value)))
            }
            _ => Err(FlowError::InvalidArgument(
                "blob does not contain a JSON object".into(),
            )),
        }
    }

    /// JSON array packet. The blob must parse as a JSON array.
    pub fn json_array(value: Blob) -> Result<Packet> {
        match serde_json::from_slice::<serde_json::Value>(value.as_slice()) {
            Ok(serde_json::Value::Array(_)) => {
                Ok(Packet::from_data(PacketData::JsonArray(value)))
            }
            _ => Err(FlowError::InvalidArgument(
                "blob does not contain a JSON array".into(),
            )),
        }
    }

    pub fn rgb(value: Rgb) -> Packet {
        Packet::from_data(PacketData::Rgb(value))
    }

    pub fn direction_vector(value: DirectionVector) -> Packet {
        Packet::from_data(PacketData::DirectionVector(value))
    }

    pub fn location(value: Location) -> Packet {
        Packet::from_data(PacketData::Location(value))
    }

    pub fn timestamp(value: SystemTime) -> Packet {
        Packet::from_data(PacketData::Timestamp(value))
    }

    pub fn error(code: i32, msg: Option<String>) -> Packet {
        Packet::from_data(PacketData::Error { code, msg })
    }

    pub fn http_response(value: HttpResponseValue) -> Packet {
        Packet::from_data(PacketData::HttpResponse(value))
    }

    /// Composed packet over `ty`. Member count and types must agree with the
    /// descriptor; members are shared, not copied.
    pub fn composed(ty: &ComposedType, members: Vec<Packet>) -> Result<Packet> {
        if members.len() != ty.member_count() {
            return Err(FlowError::InvalidArgument(format!(
                "composed type {} expects {} members, got {}",
                ty.name(),
                ty.member_count(),
                members.len()
            )));
        }
        for (member, expected) in members.iter().zip(ty.members()) {
            let actual = member.packet_type();
            if !expected.matches(&actual) {
                return Err(FlowError::InvalidType(format!(
                    "composed member of type {} where {} was declared",
                    actual, expected
                )));
            }
        }
        Ok(Packet::from_data(PacketData::Composed {
            ty: ty.clone(),
            members,
        }))
    }

    /// Uniform factory. Fails with `InvalidType` when `ty` is `Any`, with
    /// `InvalidArgument` when the value does not carry `ty`'s payload.
    /// Constant-backed types return their interned singleton.
    pub fn create(ty: &PacketType, value: PacketValue) -> Result<Packet> {
        if !ty.can_instantiate() {
            return Err(FlowError::InvalidType(
                "the any type cannot instantiate packets".into(),
            ));
        }
        match (ty, value) {
            (PacketType::Empty, PacketValue::Empty) => Ok(Packet::empty()),
            (PacketType::Boolean, PacketValue::Boolean(v)) => Ok(Packet::boolean(v)),
            (PacketType::Byte, PacketValue::Byte(v)) => Ok(Packet::byte(v)),
            (PacketType::IRange, PacketValue::IRange(v)) => Ok(Packet::irange(v)),
            (PacketType::DRange, PacketValue::DRange(v)) => Ok(Packet::drange(v)),
            (PacketType::String, PacketValue::String(v)) => Ok(Packet::string(v)),
            (PacketType::Blob, PacketValue::Blob(v)) => Ok(Packet::blob(v)),
            (PacketType::JsonObject, PacketValue::JsonObject(v)) => Packet::json_object(v),
            (PacketType::JsonArray, PacketValue::JsonArray(v)) => Packet::json_array(v),
            (PacketType::Rgb, PacketValue::Rgb(v)) => Ok(Packet::rgb(v)),
            (PacketType::DirectionVector, PacketValue::DirectionVector(v)) => {
                Ok(Packet::direction_vector(v))
            }
            (PacketType::Location, PacketValue::Location(v)) => Ok(Packet::location(v)),
            (PacketType::Timestamp, PacketValue::Timestamp(v)) => Ok(Packet::timestamp(v)),
            (PacketType::Error, PacketValue::Error { code, msg }) => {
                Ok(Packet::error(code, msg))
            }
            (PacketType::HttpResponse, PacketValue::HttpResponse(v)) => {
                Ok(Packet::http_response(v))
            }
            (PacketType::Composed(ct), PacketValue::Composed(members)) => {
                Packet::composed(ct, members)
            }
            (ty, value) => Err(FlowError::InvalidArgument(format!(
                "value {:?} does not carry a {} payload",
                value, ty
            ))),
        }
    }

    /// A new handle on the same payload. Blob-bearing packets keep sharing
    /// their buffer; composed packets share their members.
    pub fn duplicate(&self) -> Packet {
        self.clone()
    }

    pub fn packet_type(&self) -> PacketType {
        match &*self.data {
            PacketData::Empty => PacketType::Empty,
            PacketData::Boolean(_) => PacketType::Boolean,
            PacketData::Byte(_) => PacketType::Byte,
            PacketData::IRange(_) => PacketType::IRange,
            PacketData::DRange(_) => PacketType::DRange,
            PacketData::String(_) => PacketType::String,
            PacketData::Blob(_) => PacketType::Blob,
            PacketData::JsonObject(_) => PacketType::JsonObject,
            PacketData::JsonArray(_) => PacketType::JsonArray,
            PacketData::Rgb(_) => PacketType::Rgb,
            PacketData::DirectionVector(_) => PacketType::DirectionVector,
            PacketData::Location(_) => PacketType::Location,
            PacketData::Timestamp(_) => PacketType::Timestamp,
            PacketData::Error { .. } => PacketType::Error,
            PacketData::HttpResponse(_) => PacketType::HttpResponse,
            PacketData::Composed { ty, .. } => PacketType::Composed(ty.clone()),
        }
    }

    /// True when both packets share the same payload cell. Interned
    /// singletons compare pointer-equal across calls.
    pub fn ptr_eq(&self, other: &Packet) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    fn type_error(&self, wanted: &str) -> FlowError {
        FlowError::InvalidType(format!(
            "packet is {}, not {}",
            self.packet_type(),
            wanted
        ))
    }

    pub fn as_boolean(&self) -> Result<bool> {
        match &*self.data {
            PacketData::Boolean(v) => Ok(*v),
            _ => Err(self.type_error("boolean")),
        }
    }

    pub fn as_byte(&self) -> Result<u8> {
        match &*self.data {
            PacketData::Byte(v) => Ok(*v),
            _ => Err(self.type_error("byte")),
        }
    }

    pub fn as_irange(&self) -> Result<IntRange> {
        match &*self.data {
            PacketData::IRange(v) => Ok(*v),
            _ => Err(self.type_error("irange")),
        }
    }

    pub fn as_drange(&self) -> Result<FloatRange> {
        match &*self.data {
            PacketData::DRange(v) => Ok(*v),
            _ => Err(self.type_error("drange")),
        }
    }

    pub fn as_string(&self) -> Result<&str> {
        match &*self.data {
            PacketData::String(v) => Ok(v),
            _ => Err(self.type_error("string")),
        }
    }

    pub fn as_blob(&self) -> Result<&Blob> {
        match &*self.data {
            PacketData::Blob(v)
            | PacketData::JsonObject(v)
            | PacketData::JsonArray(v) => Ok(v),
            _ => Err(self.type_error("blob")),
        }
    }

    pub fn as_rgb(&self) -> Result<Rgb> {
        match &*self.data {
            PacketData::Rgb(v) => Ok(*v),
            _ => Err(self.type_error("rgb")),
        }
    }

    pub fn as_direction_vector(&self) -> Result<DirectionVector> {
        match &*self.data {
            PacketData::DirectionVector(v) => Ok(*v),
            _ => Err(self.type_error("direction-vector")),
        }
    }

    pub fn as_location(&self) -> Result<Location> {
        match &*self.data {
            PacketData::Location(v) => Ok(*v),
            _ => Err(self.type_error("location")),
        }
    }

    pub fn as_timestamp(&self) -> Result<SystemTime> {
        match &*self.data {
            PacketData::Timestamp(v) => Ok(*v),
            _ => Err(self.type_error("timestamp")),
        }
    }

    pub fn as_error(&self) -> Result<(i32, Option<&str>)> {
        match &*self.data {
            PacketData::Error { code, msg } => Ok((*code, msg.as_deref())),
            _ => Err(self.type_error("error")),
        }
    }

    pub fn as_http_response(&self) -> Result<&HttpResponseValue> {
        match &*self.data {
            PacketData::HttpResponse(v) => Ok(v),
            _ => Err(self.type_error("http-response")),
        }
    }

    /// Member list of a composed packet.
    pub fn composed_members(&self) -> Result<(&ComposedType, &[Packet])> {
        match &*self.data {
            PacketData::Composed { ty, members } => Ok((ty, members)),
            _ => Err(self.type_error("composed")),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(&*self.data, PacketData::Error { .. })
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("type", &self.packet_type().name())
            .field("data", &self.data)
            .finish()
    }
}
