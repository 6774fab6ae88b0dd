//! BSON value model
//!
//! `Bson` is the tagged union over every wire-format element. Arrays and
//! documents own their children, so a value is always a finite tree.

use std::fmt;

use crate::datetime::DateTime;
use crate::document::Document;
use crate::oid::ObjectId;

/// Element type tags as they appear on the wire
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Double = 0x01,
    String = 0x02,
    Document = 0x03,
    Array = 0x04,
    Binary = 0x05,
    Undefined = 0x06,
    ObjectId = 0x07,
    Boolean = 0x08,
    DateTime = 0x09,
    Null = 0x0A,
    RegularExpression = 0x0B,
    JavaScriptCode = 0x0D,
    Symbol = 0x0E,
    JavaScriptCodeWithScope = 0x0F,
    Int32 = 0x10,
    Timestamp = 0x11,
    Int64 = 0x12,
    MaxKey = 0x7F,
    MinKey = 0xFF,
}

impl ElementType {
    /// Map a wire tag to its element type
    pub fn from_u8(tag: u8) -> Option<Self> {
        let ty = match tag {
            0x01 => ElementType::Double,
            0x02 => ElementType::String,
            0x03 => ElementType::Document,
            0x04 => ElementType::Array,
            0x05 => ElementType::Binary,
            0x06 => ElementType::Undefined,
            0x07 => ElementType::ObjectId,
            0x08 => ElementType::Boolean,
            0x09 => ElementType::DateTime,
            0x0A => ElementType::Null,
            0x0B => ElementType::RegularExpression,
            0x0D => ElementType::JavaScriptCode,
            0x0E => ElementType::Symbol,
            0x0F => ElementType::JavaScriptCodeWithScope,
            0x10 => ElementType::Int32,
            0x11 => ElementType::Timestamp,
            0x12 => ElementType::Int64,
            0x7F => ElementType::MaxKey,
            0xFF => ElementType::MinKey,
            _ => return None,
        };
        Some(ty)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ElementType::Double => "Double",
            ElementType::String => "String",
            ElementType::Document => "Document",
            ElementType::Array => "Array",
            ElementType::Binary => "Binary",
            ElementType::Undefined => "Undefined",
            ElementType::ObjectId => "ObjectId",
            ElementType::Boolean => "Boolean",
            ElementType::DateTime => "DateTime",
            ElementType::Null => "Null",
            ElementType::RegularExpression => "RegularExpression",
            ElementType::JavaScriptCode => "JavaScriptCode",
            ElementType::Symbol => "Symbol",
            ElementType::JavaScriptCodeWithScope => "JavaScriptCodeWithScope",
            ElementType::Int32 => "Int32",
            ElementType::Timestamp => "Timestamp",
            ElementType::Int64 => "Int64",
            ElementType::MaxKey => "MaxKey",
            ElementType::MinKey => "MinKey",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Binary subtype tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinarySubtype {
    Generic,
    Function,
    /// Deprecated layout with an extra inner length prefix
    BinaryOld,
    UuidLegacy,
    Uuid,
    Md5,
    Reserved(u8),
    UserDefined(u8),
}

impl From<u8> for BinarySubtype {
    fn from(tag: u8) -> Self {
        match tag {
            0x00 => BinarySubtype::Generic,
            0x01 => BinarySubtype::Function,
            0x02 => BinarySubtype::BinaryOld,
            0x03 => BinarySubtype::UuidLegacy,
            0x04 => BinarySubtype::Uuid,
            0x05 => BinarySubtype::Md5,
            0x80..=0xFF => BinarySubtype::UserDefined(tag),
            other => BinarySubtype::Reserved(other),
        }
    }
}

impl From<BinarySubtype> for u8 {
    fn from(subtype: BinarySubtype) -> u8 {
        match subtype {
            BinarySubtype::Generic => 0x00,
            BinarySubtype::Function => 0x01,
            BinarySubtype::BinaryOld => 0x02,
            BinarySubtype::UuidLegacy => 0x03,
            BinarySubtype::Uuid => 0x04,
            BinarySubtype::Md5 => 0x05,
            BinarySubtype::Reserved(tag) | BinarySubtype::UserDefined(tag) => tag,
        }
    }
}

/// Binary blob with its subtype
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binary {
    pub subtype: BinarySubtype,
    pub bytes: Vec<u8>,
}

impl Binary {
    pub fn new(subtype: BinarySubtype, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            subtype,
            bytes: bytes.into(),
        }
    }

    pub fn generic(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(BinarySubtype::Generic, bytes)
    }

    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self::new(BinarySubtype::Uuid, uuid.as_bytes().to_vec())
    }

    /// Interpret a 16-byte UUID-subtype blob as a `Uuid`
    pub fn to_uuid(&self) -> Option<uuid::Uuid> {
        match self.subtype {
            BinarySubtype::Uuid | BinarySubtype::UuidLegacy => {
                uuid::Uuid::from_slice(&self.bytes).ok()
            }
            _ => None,
        }
    }
}

/// Regular expression (pattern + option flags)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Regex {
    pub pattern: String,
    pub options: String,
}

impl Regex {
    /// Options are stored sorted, as servers expect
    pub fn new(pattern: impl Into<String>, options: impl AsRef<str>) -> Self {
        let mut chars: Vec<char> = options.as_ref().chars().collect();
        chars.sort_unstable();
        Self {
            pattern: pattern.into(),
            options: chars.into_iter().collect(),
        }
    }
}

/// Internal replication timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    /// Seconds since the epoch
    pub time: u32,
    /// Ordinal within the second
    pub increment: u32,
}

impl Timestamp {
    pub fn from_u64(raw: u64) -> Self {
        Self {
            time: (raw >> 32) as u32,
            increment: (raw & 0xFFFF_FFFF) as u32,
        }
    }

    pub fn to_u64(self) -> u64 {
        ((self.time as u64) << 32) | self.increment as u64
    }
}

/// JavaScript code with its scope document
#[derive(Debug, Clone, PartialEq)]
pub struct JavaScriptCodeWithScope {
    pub code: String,
    pub scope: Document,
}

/// A BSON value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Bson {
    Double(f64),
    String(String),
    Document(Document),
    Array(Vec<Bson>),
    Binary(Binary),
    Undefined,
    ObjectId(ObjectId),
    Boolean(bool),
    DateTime(DateTime),
    #[default]
    Null,
    RegularExpression(Regex),
    JavaScriptCode(String),
    Symbol(String),
    JavaScriptCodeWithScope(JavaScriptCodeWithScope),
    Int32(i32),
    Timestamp(Timestamp),
    Int64(i64),
    MaxKey,
    MinKey,
}

impl Bson {
    pub fn element_type(&self) -> ElementType {
        match self {
            Bson::Double(_) => ElementType::Double,
            Bson::String(_) => ElementType::String,
            Bson::Document(_) => ElementType::Document,
            Bson::Array(_) => ElementType::Array,
            Bson::Binary(_) => ElementType::Binary,
            Bson::Undefined => ElementType::Undefined,
            Bson::ObjectId(_) => ElementType::ObjectId,
            Bson::Boolean(_) => ElementType::Boolean,
            Bson::DateTime(_) => ElementType::DateTime,
            Bson::Null => ElementType::Null,
            Bson::RegularExpression(_) => ElementType::RegularExpression,
            Bson::JavaScriptCode(_) => ElementType::JavaScriptCode,
            Bson::Symbol(_) => ElementType::Symbol,
            Bson::JavaScriptCodeWithScope(_) => ElementType::JavaScriptCodeWithScope,
            Bson::Int32(_) => ElementType::Int32,
            Bson::Timestamp(_) => ElementType::Timestamp,
            Bson::Int64(_) => ElementType::Int64,
            Bson::MaxKey => ElementType::MaxKey,
            Bson::MinKey => ElementType::MinKey,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Bson::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Bson::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Bson::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Bson::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Bson::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Bson::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Bson>> {
        match self {
            Bson::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Bson::ObjectId(oid) => Some(*oid),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime> {
        match self {
            Bson::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Binary> {
        match self {
            Bson::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Bson::Null | Bson::Undefined)
    }

    /// Any numeric element widened to `f64`
    pub fn as_f64_lossy(&self) -> Option<f64> {
        match self {
            Bson::Double(v) => Some(*v),
            Bson::Int32(v) => Some(*v as f64),
            Bson::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Any numeric element narrowed or widened to `i64`
    pub fn as_i64_lossy(&self) -> Option<i64> {
        match self {
            Bson::Int32(v) => Some(*v as i64),
            Bson::Int64(v) => Some(*v),
            Bson::Double(v) if v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    /// Loose boolean interpretation used for server status flags
    ///
    /// Servers report fields such as `ok` or `ismaster` as booleans, ints or
    /// doubles depending on version.
    pub fn as_truthy(&self) -> bool {
        match self {
            Bson::Boolean(b) => *b,
            Bson::Int32(v) => *v != 0,
            Bson::Int64(v) => *v != 0,
            Bson::Double(v) => *v != 0.0 && !v.is_nan(),
            Bson::String(s) => !s.is_empty(),
            Bson::Null | Bson::Undefined => false,
            _ => true,
        }
    }

    /// Human-readable name of the held element type
    pub fn type_name(&self) -> &'static str {
        self.element_type().name()
    }
}

impl fmt::Display for Bson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bson::Double(v) => write!(f, "{}", v),
            Bson::String(s) => write!(f, "\"{}\"", s),
            Bson::Document(d) => write!(f, "{}", d),
            Bson::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Bson::Binary(b) => write!(f, "Binary({:?}, {})", b.subtype, hex::encode(&b.bytes)),
            Bson::Undefined => f.write_str("undefined"),
            Bson::ObjectId(oid) => write!(f, "ObjectId(\"{}\")", oid),
            Bson::Boolean(b) => write!(f, "{}", b),
            Bson::DateTime(dt) => write!(f, "ISODate(\"{}\")", dt),
            Bson::Null => f.write_str("null"),
            Bson::RegularExpression(re) => write!(f, "/{}/{}", re.pattern, re.options),
            Bson::JavaScriptCode(code) => write!(f, "{}", code),
            Bson::Symbol(s) => write!(f, "Symbol(\"{}\")", s),
            Bson::JavaScriptCodeWithScope(c) => write!(f, "{} with {}", c.code, c.scope),
            Bson::Int32(v) => write!(f, "{}", v),
            Bson::Timestamp(ts) => write!(f, "Timestamp({}, {})", ts.time, ts.increment),
            Bson::Int64(v) => write!(f, "NumberLong({})", v),
            Bson::MaxKey => f.write_str("MaxKey"),
            Bson::MinKey => f.write_str("MinKey"),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Bson {
                fn from(value: $ty) -> Self {
                    Bson::$variant(value.into())
                }
            }
        )*
    };
}

impl_from! {
    f64 => Double,
    f32 => Double,
    String => String,
    &str => String,
    Document => Document,
    Vec<Bson> => Array,
    Binary => Binary,
    ObjectId => ObjectId,
    bool => Boolean,
    DateTime => DateTime,
    Regex => RegularExpression,
    i32 => Int32,
    Timestamp => Timestamp,
    i64 => Int64,
}

impl From<&String> for Bson {
    fn from(value: &String) -> Self {
        Bson::String(value.clone())
    }
}

impl From<uuid::Uuid> for Bson {
    fn from(value: uuid::Uuid) -> Self {
        Bson::Binary(Binary::from_uuid(value))
    }
}

impl<T: Into<Bson>> From<Option<T>> for Bson {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Bson::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_type_tags() {
        for tag in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x07, 0x08, 0x09, 0x0A, 0x10, 0x11, 0x12, 0x7F, 0xFF] {
            let ty = ElementType::from_u8(tag).unwrap();
            assert_eq!(ty as u8, tag);
        }
        assert!(ElementType::from_u8(0x00).is_none());
        assert!(ElementType::from_u8(0x0C).is_none());
        assert!(ElementType::from_u8(0x20).is_none());
    }

    #[test]
    fn test_binary_subtype_mapping() {
        assert_eq!(BinarySubtype::from(0x04), BinarySubtype::Uuid);
        assert_eq!(BinarySubtype::from(0x85), BinarySubtype::UserDefined(0x85));
        assert_eq!(BinarySubtype::from(0x09), BinarySubtype::Reserved(0x09));
        assert_eq!(u8::from(BinarySubtype::BinaryOld), 0x02);
    }

    #[test]
    fn test_truthiness() {
        assert!(Bson::Int32(1).as_truthy());
        assert!(!Bson::Int32(0).as_truthy());
        assert!(Bson::Double(1.0).as_truthy());
        assert!(!Bson::Double(0.0).as_truthy());
        assert!(!Bson::Null.as_truthy());
        assert!(Bson::Boolean(true).as_truthy());
        assert!(Bson::Document(Document::new()).as_truthy());
    }

    #[test]
    fn test_timestamp_layout() {
        let ts = Timestamp { time: 7, increment: 3 };
        assert_eq!(ts.to_u64(), (7u64 << 32) | 3);
        assert_eq!(Timestamp::from_u64(ts.to_u64()), ts);
    }

    #[test]
    fn test_regex_options_sorted() {
        let re = Regex::new("^a", "xmi");
        assert_eq!(re.options, "imx");
    }

    #[test]
    fn test_uuid_binary() {
        let id = uuid::Uuid::new_v4();
        let bin = Binary::from_uuid(id);
        assert_eq!(bin.subtype, BinarySubtype::Uuid);
        assert_eq!(bin.to_uuid(), Some(id));
        assert_eq!(Binary::generic(vec![1, 2]).to_uuid(), None);
    }

    #[test]
    fn test_from_option() {
        assert_eq!(Bson::from(None::<i32>), Bson::Null);
        assert_eq!(Bson::from(Some("x")), Bson::String("x".to_string()));
    }

    #[test]
    fn test_lossy_numbers() {
        assert_eq!(Bson::Int32(5).as_f64_lossy(), Some(5.0));
        assert_eq!(Bson::Double(4.0).as_i64_lossy(), Some(4));
        assert_eq!(Bson::String("4".into()).as_i64_lossy(), None);
    }
}
