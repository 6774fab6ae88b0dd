//! Serializer contracts

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{BsonError, Result};
use crate::raw::{BsonReader, BsonWriter};

use super::context::SerializationContext;
use super::id_generator::IdGenerator;
use super::types::{AnyObject, TypeKey};

/// Converts values of one type to and from BSON
///
/// The erased form works on `&dyn Any` / [`AnyObject`] so the registry can
/// hold serializers for arbitrary types side by side. `nominal` is the type
/// the caller declared at this position, which may be a supertype of
/// [`value_type`](Self::value_type).
pub trait BsonSerializer: Send + Sync {
    fn value_type(&self) -> TypeKey;

    fn serialize(
        &self,
        writer: &mut BsonWriter,
        nominal: TypeKey,
        value: &dyn Any,
        ctx: &SerializationContext,
    ) -> Result<()>;

    fn deserialize(
        &self,
        reader: &mut BsonReader<'_>,
        nominal: TypeKey,
        ctx: &SerializationContext,
    ) -> Result<AnyObject>;

    /// Document-id access, for serializers of types that carry an `_id`
    fn id_provider(&self) -> Option<&dyn IdProvider> {
        None
    }
}

/// Access to the id member of a document type
pub trait IdProvider: Send + Sync {
    /// Declared id type and current id value, if the type has an id member
    fn get_document_id<'a>(&self, document: &'a dyn Any) -> Result<Option<(TypeKey, &'a dyn Any)>>;

    fn set_document_id(&self, document: &mut dyn Any, id: AnyObject) -> Result<()>;

    /// Generator configured for this type, overriding the per-id-type default
    fn id_generator(&self) -> Option<Arc<dyn IdGenerator>> {
        None
    }
}

/// Statically typed serializer, adapted to [`BsonSerializer`] by [`typed`]
pub trait TypedSerializer<T>: Send + Sync {
    fn serialize(&self, writer: &mut BsonWriter, value: &T, ctx: &SerializationContext) -> Result<()>;

    fn deserialize(&self, reader: &mut BsonReader<'_>, ctx: &SerializationContext) -> Result<T>;
}

struct TypedAdapter<T, S> {
    inner: S,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S> BsonSerializer for TypedAdapter<T, S>
where
    T: Any + Send,
    S: TypedSerializer<T>,
{
    fn value_type(&self) -> TypeKey {
        TypeKey::of::<T>()
    }

    fn serialize(
        &self,
        writer: &mut BsonWriter,
        _nominal: TypeKey,
        value: &dyn Any,
        ctx: &SerializationContext,
    ) -> Result<()> {
        let value = downcast_value::<T>(value)?;
        self.inner.serialize(writer, value, ctx)
    }

    fn deserialize(
        &self,
        reader: &mut BsonReader<'_>,
        _nominal: TypeKey,
        ctx: &SerializationContext,
    ) -> Result<AnyObject> {
        Ok(Box::new(self.inner.deserialize(reader, ctx)?))
    }
}

/// Wrap a typed serializer for registration
pub fn typed<T, S>(serializer: S) -> Arc<dyn BsonSerializer>
where
    T: Any + Send,
    S: TypedSerializer<T> + 'static,
{
    Arc::new(TypedAdapter {
        inner: serializer,
        _marker: PhantomData,
    })
}

/// Types that know how to write and read themselves
pub trait BsonSerializable: Any + Send + Sized {
    fn serialize_bson(&self, writer: &mut BsonWriter, ctx: &SerializationContext) -> Result<()>;

    fn deserialize_bson(reader: &mut BsonReader<'_>, ctx: &SerializationContext) -> Result<Self>;
}

pub(crate) struct SelfSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SelfSerializer<T> {
    pub(crate) fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T: BsonSerializable> BsonSerializer for SelfSerializer<T> {
    fn value_type(&self) -> TypeKey {
        TypeKey::of::<T>()
    }

    fn serialize(
        &self,
        writer: &mut BsonWriter,
        _nominal: TypeKey,
        value: &dyn Any,
        ctx: &SerializationContext,
    ) -> Result<()> {
        downcast_value::<T>(value)?.serialize_bson(writer, ctx)
    }

    fn deserialize(
        &self,
        reader: &mut BsonReader<'_>,
        _nominal: TypeKey,
        ctx: &SerializationContext,
    ) -> Result<AnyObject> {
        Ok(Box::new(T::deserialize_bson(reader, ctx)?))
    }
}

pub(crate) fn downcast_value<T: Any>(value: &dyn Any) -> Result<&T> {
    value
        .downcast_ref::<T>()
        .ok_or_else(|| BsonError::type_mismatch(TypeKey::of::<T>().short_name(), "a value of another type"))
}
