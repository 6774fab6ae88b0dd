//! Built-in serializers for the primitive types and the value model

use std::collections::HashMap;
use std::sync::Arc;

use crate::datetime::DateTime;
use crate::document::Document;
use crate::error::{BsonError, Result};
use crate::oid::ObjectId;
use crate::raw::{BsonReader, BsonWriter, ReaderState};
use crate::value::{Binary, BinarySubtype, Bson, ElementType};

use super::context::SerializationContext;
use super::registry::SerializationProvider;
use super::serializer::{typed, BsonSerializer, TypedSerializer};
use super::types::{TypeCatalog, TypeKey};

fn unexpected(expected: &str, reader: &BsonReader<'_>) -> BsonError {
    let actual = reader
        .current_type()
        .map(|t| t.name())
        .unwrap_or("no value");
    BsonError::type_mismatch(expected, actual)
}

pub struct BooleanSerializer;

impl TypedSerializer<bool> for BooleanSerializer {
    fn serialize(&self, writer: &mut BsonWriter, value: &bool, _: &SerializationContext) -> Result<()> {
        writer.write_boolean(*value)
    }

    fn deserialize(&self, reader: &mut BsonReader<'_>, _: &SerializationContext) -> Result<bool> {
        reader.read_boolean()
    }
}

pub struct Int32Serializer;

impl TypedSerializer<i32> for Int32Serializer {
    fn serialize(&self, writer: &mut BsonWriter, value: &i32, _: &SerializationContext) -> Result<()> {
        writer.write_int32(*value)
    }

    fn deserialize(&self, reader: &mut BsonReader<'_>, _: &SerializationContext) -> Result<i32> {
        match reader.current_type() {
            Some(ElementType::Int32) => reader.read_int32(),
            Some(ElementType::Int64) => {
                let v = reader.read_int64()?;
                i32::try_from(v).map_err(|_| BsonError::type_mismatch("Int32", format!("Int64 {}", v)))
            }
            Some(ElementType::Double) => {
                let v = reader.read_double()?;
                if v.fract() == 0.0 && v >= i32::MIN as f64 && v <= i32::MAX as f64 {
                    Ok(v as i32)
                } else {
                    Err(BsonError::type_mismatch("Int32", format!("Double {}", v)))
                }
            }
            _ => Err(unexpected("Int32", reader)),
        }
    }
}

pub struct Int64Serializer;

impl TypedSerializer<i64> for Int64Serializer {
    fn serialize(&self, writer: &mut BsonWriter, value: &i64, _: &SerializationContext) -> Result<()> {
        writer.write_int64(*value)
    }

    fn deserialize(&self, reader: &mut BsonReader<'_>, _: &SerializationContext) -> Result<i64> {
        match reader.current_type() {
            Some(ElementType::Int64) => reader.read_int64(),
            Some(ElementType::Int32) => Ok(reader.read_int32()? as i64),
            Some(ElementType::Double) => {
                let v = reader.read_double()?;
                if v.fract() == 0.0 && v.is_finite() {
                    Ok(v as i64)
                } else {
                    Err(BsonError::type_mismatch("Int64", format!("Double {}", v)))
                }
            }
            _ => Err(unexpected("Int64", reader)),
        }
    }
}

pub struct DoubleSerializer;

impl TypedSerializer<f64> for DoubleSerializer {
    fn serialize(&self, writer: &mut BsonWriter, value: &f64, _: &SerializationContext) -> Result<()> {
        writer.write_double(*value)
    }

    fn deserialize(&self, reader: &mut BsonReader<'_>, _: &SerializationContext) -> Result<f64> {
        match reader.current_type() {
            Some(ElementType::Double) => reader.read_double(),
            Some(ElementType::Int32) => Ok(reader.read_int32()? as f64),
            Some(ElementType::Int64) => Ok(reader.read_int64()? as f64),
            _ => Err(unexpected("Double", reader)),
        }
    }
}

pub struct StringSerializer;

impl TypedSerializer<String> for StringSerializer {
    fn serialize(&self, writer: &mut BsonWriter, value: &String, _: &SerializationContext) -> Result<()> {
        writer.write_string(value)
    }

    fn deserialize(&self, reader: &mut BsonReader<'_>, _: &SerializationContext) -> Result<String> {
        match reader.current_type() {
            Some(ElementType::String) => reader.read_string(),
            Some(ElementType::Symbol) => reader.read_symbol(),
            _ => Err(unexpected("String", reader)),
        }
    }
}

pub struct ObjectIdSerializer;

impl TypedSerializer<ObjectId> for ObjectIdSerializer {
    fn serialize(&self, writer: &mut BsonWriter, value: &ObjectId, _: &SerializationContext) -> Result<()> {
        writer.write_object_id(*value)
    }

    fn deserialize(&self, reader: &mut BsonReader<'_>, _: &SerializationContext) -> Result<ObjectId> {
        reader.read_object_id()
    }
}

pub struct DateTimeSerializer;

impl TypedSerializer<DateTime> for DateTimeSerializer {
    fn serialize(&self, writer: &mut BsonWriter, value: &DateTime, _: &SerializationContext) -> Result<()> {
        writer.write_datetime(*value)
    }

    fn deserialize(&self, reader: &mut BsonReader<'_>, _: &SerializationContext) -> Result<DateTime> {
        reader.read_datetime()
    }
}

pub struct UuidSerializer;

impl TypedSerializer<uuid::Uuid> for UuidSerializer {
    fn serialize(&self, writer: &mut BsonWriter, value: &uuid::Uuid, _: &SerializationContext) -> Result<()> {
        writer.write_binary(&Binary::from_uuid(*value))
    }

    fn deserialize(&self, reader: &mut BsonReader<'_>, _: &SerializationContext) -> Result<uuid::Uuid> {
        let binary = reader.read_binary()?;
        binary.to_uuid().ok_or_else(|| {
            BsonError::type_mismatch(
                "UUID binary",
                format!("{:?} binary of {} bytes", binary.subtype, binary.bytes.len()),
            )
        })
    }
}

pub struct BytesSerializer;

impl TypedSerializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, writer: &mut BsonWriter, value: &Vec<u8>, _: &SerializationContext) -> Result<()> {
        writer.write_binary(&Binary::new(BinarySubtype::Generic, value.clone()))
    }

    fn deserialize(&self, reader: &mut BsonReader<'_>, _: &SerializationContext) -> Result<Vec<u8>> {
        Ok(reader.read_binary()?.bytes)
    }
}

pub struct BsonValueSerializer;

impl TypedSerializer<Bson> for BsonValueSerializer {
    fn serialize(&self, writer: &mut BsonWriter, value: &Bson, _: &SerializationContext) -> Result<()> {
        writer.write_value(value)
    }

    fn deserialize(&self, reader: &mut BsonReader<'_>, _: &SerializationContext) -> Result<Bson> {
        if reader.state() == ReaderState::Initial {
            return Ok(Bson::Document(reader.read_document()?));
        }
        reader.read_value()
    }
}

pub struct DocumentSerializer;

impl TypedSerializer<Document> for DocumentSerializer {
    fn serialize(&self, writer: &mut BsonWriter, value: &Document, _: &SerializationContext) -> Result<()> {
        writer.write_document(value)
    }

    fn deserialize(&self, reader: &mut BsonReader<'_>, _: &SerializationContext) -> Result<Document> {
        reader.read_document()
    }
}

/// Lowest-priority provider: serializers for the built-in types
pub struct DefaultSerializationProvider {
    serializers: HashMap<TypeKey, Arc<dyn BsonSerializer>>,
}

impl DefaultSerializationProvider {
    pub fn new() -> Self {
        let entries: Vec<Arc<dyn BsonSerializer>> = vec![
            typed::<bool, _>(BooleanSerializer),
            typed::<i32, _>(Int32Serializer),
            typed::<i64, _>(Int64Serializer),
            typed::<f64, _>(DoubleSerializer),
            typed::<String, _>(StringSerializer),
            typed::<ObjectId, _>(ObjectIdSerializer),
            typed::<DateTime, _>(DateTimeSerializer),
            typed::<uuid::Uuid, _>(UuidSerializer),
            typed::<Vec<u8>, _>(BytesSerializer),
            typed::<Bson, _>(BsonValueSerializer),
            typed::<Document, _>(DocumentSerializer),
        ];
        Self {
            serializers: entries.into_iter().map(|s| (s.value_type(), s)).collect(),
        }
    }

    pub(crate) fn builtin_keys() -> Vec<TypeKey> {
        vec![
            TypeKey::of::<bool>(),
            TypeKey::of::<i32>(),
            TypeKey::of::<i64>(),
            TypeKey::of::<f64>(),
            TypeKey::of::<String>(),
            TypeKey::of::<ObjectId>(),
            TypeKey::of::<DateTime>(),
            TypeKey::of::<uuid::Uuid>(),
            TypeKey::of::<Vec<u8>>(),
            TypeKey::of::<Bson>(),
            TypeKey::of::<Document>(),
        ]
    }
}

impl Default for DefaultSerializationProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SerializationProvider for DefaultSerializationProvider {
    fn get_serializer(&self, key: TypeKey, _catalog: &TypeCatalog) -> Option<Arc<dyn BsonSerializer>> {
        self.serializers.get(&key).cloned()
    }
}

/// Maps a wire element to the primitive type it decodes to without a discriminator
pub(crate) fn primitive_type_for(wire: ElementType, reader: &BsonReader<'_>) -> Result<Option<TypeKey>> {
    let key = match wire {
        ElementType::Boolean => TypeKey::of::<bool>(),
        ElementType::Binary => match reader.peek_binary_subtype()? {
            BinarySubtype::Uuid | BinarySubtype::UuidLegacy => TypeKey::of::<uuid::Uuid>(),
            _ => TypeKey::of::<Vec<u8>>(),
        },
        ElementType::DateTime => TypeKey::of::<DateTime>(),
        ElementType::Double => TypeKey::of::<f64>(),
        ElementType::Int32 => TypeKey::of::<i32>(),
        ElementType::Int64 => TypeKey::of::<i64>(),
        ElementType::ObjectId => TypeKey::of::<ObjectId>(),
        ElementType::String => TypeKey::of::<String>(),
        _ => return Ok(None),
    };
    Ok(Some(key))
}
