//! # Value Model
//!
//! Values that can be copied out of (or into) a runtime, and the opaque
//! references used for everything that stays inside one.

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de;
use serde::de::DeserializeSeed;
use serde::de::EnumAccess;
use serde::de::SeqAccess;
use serde::de::VariantAccess;
use serde::de::Visitor;
use serde::ser;
use serde::ser::SerializeSeq;

/// The maximum number of nested lists a [`Value`] may carry across the
/// boundary, in either direction.
pub const MAX_NESTING_DEPTH: usize = 64;

/// A runtime value expressed in host terms.
///
/// This is the domain that survives serialization between instances:
/// primitives, strings, and ordered sequences of those.
///
/// Serialization is bounded by [`MAX_NESTING_DEPTH`]: a deeper value fails to
/// encode or decode instead of exhausting the stack.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    /// Short name of the variant, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{:?}", x),
            Self::Str(s) => write!(f, "{:?}", s),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

// ============================================================================
//  SERDE
// ============================================================================

const VARIANTS: &[&str] = &["None", "Bool", "Int", "Float", "Str", "List"];
const TOO_DEEP: &str = "recursion limit exceeded";

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Nested { value: self, depth: 0 }.serialize(serializer)
    }
}

struct Nested<'a> {
    value: &'a Value,
    depth: usize,
}

impl Serialize for Nested<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.value {
            Value::None => serializer.serialize_unit_variant("Value", 0, VARIANTS[0]),
            Value::Bool(b) => serializer.serialize_newtype_variant("Value", 1, VARIANTS[1], b),
            Value::Int(i) => serializer.serialize_newtype_variant("Value", 2, VARIANTS[2], i),
            Value::Float(x) => serializer.serialize_newtype_variant("Value", 3, VARIANTS[3], x),
            Value::Str(s) => serializer.serialize_newtype_variant("Value", 4, VARIANTS[4], s),
            Value::List(items) => {
                if self.depth >= MAX_NESTING_DEPTH {
                    return Err(ser::Error::custom(TOO_DEEP));
                }
                let list = NestedList { items, depth: self.depth + 1 };
                serializer.serialize_newtype_variant("Value", 5, VARIANTS[5], &list)
            }
        }
    }
}

struct NestedList<'a> {
    items: &'a [Value],
    depth: usize,
}

impl Serialize for NestedList<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.items.len()))?;
        for value in self.items {
            seq.serialize_element(&Nested { value, depth: self.depth })?;
        }
        seq.end()
    }
}

enum Tag {
    None,
    Bool,
    Int,
    Float,
    Str,
    List,
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_identifier(TagVisitor)
    }
}

struct TagVisitor;

impl Visitor<'_> for TagVisitor {
    type Value = Tag;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("a value variant")
    }

    fn visit_u64<E: de::Error>(self, index: u64) -> Result<Tag, E> {
        match index {
            0 => Ok(Tag::None),
            1 => Ok(Tag::Bool),
            2 => Ok(Tag::Int),
            3 => Ok(Tag::Float),
            4 => Ok(Tag::Str),
            5 => Ok(Tag::List),
            _ => Err(E::invalid_value(de::Unexpected::Unsigned(index), &self)),
        }
    }

    fn visit_str<E: de::Error>(self, name: &str) -> Result<Tag, E> {
        match name {
            "None" => Ok(Tag::None),
            "Bool" => Ok(Tag::Bool),
            "Int" => Ok(Tag::Int),
            "Float" => Ok(Tag::Float),
            "Str" => Ok(Tag::Str),
            "List" => Ok(Tag::List),
            _ => Err(E::unknown_variant(name, VARIANTS)),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        ValueSeed { depth: 0 }.deserialize(deserializer)
    }
}

/// Deserializes a value found `depth` lists deep.
#[derive(Copy, Clone)]
struct ValueSeed {
    depth: usize,
}

impl<'de> DeserializeSeed<'de> for ValueSeed {
    type Value = Value;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_enum("Value", VARIANTS, self)
    }
}

impl<'de> Visitor<'de> for ValueSeed {
    type Value = Value;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("a value")
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<Value, A::Error> {
        let (tag, variant) = data.variant::<Tag>()?;
        match tag {
            Tag::None => variant.unit_variant().map(|()| Value::None),
            Tag::Bool => variant.newtype_variant().map(Value::Bool),
            Tag::Int => variant.newtype_variant().map(Value::Int),
            Tag::Float => variant.newtype_variant().map(Value::Float),
            Tag::Str => variant.newtype_variant().map(Value::Str),
            Tag::List => {
                if self.depth >= MAX_NESTING_DEPTH {
                    return Err(de::Error::custom(TOO_DEEP));
                }
                variant.newtype_variant_seed(ListSeed { depth: self.depth + 1 }).map(Value::List)
            }
        }
    }
}

struct ListSeed {
    depth: usize,
}

impl<'de> DeserializeSeed<'de> for ListSeed {
    type Value = Vec<Value>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Vec<Value>, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for ListSeed {
    type Value = Vec<Value>;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("a list of values")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<Value>, A::Error> {
        // The length prefix is untrusted; let the vector grow as items arrive.
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(1024));
        while let Some(item) = seq.next_element_seed(ValueSeed { depth: self.depth })? {
            items.push(item);
        }
        Ok(items)
    }
}

/// Identity of a runtime-side session, assigned by the runtime.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKey(pub u64);

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Manager-wide identifier of a replicated value.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "object-{}", self.0)
    }
}

/// Reference to an object living inside one runtime session.
///
/// An `Obj` carries no data. It is only meaningful to the session named by
/// `session`; presenting it anywhere else is an ownership violation.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obj {
    pub session: SessionKey,
    pub slot: u32,
}

impl Obj {
    pub fn new(session: SessionKey, slot: u32) -> Self {
        Self { session, slot }
    }
}

impl std::fmt::Display for Obj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.session, self.slot)
    }
}
