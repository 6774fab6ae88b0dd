//! Generic serializer templates for `Vec<T>`, `Option<T>` and `HashMap<String, T>`
//!
//! A declared generic instance carries a *shape*: monomorphized functions
//! that build and take apart the container without knowing `T` statically.
//! Element serializers are looked up through the context at use time.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{BsonError, Result};
use crate::raw::{BsonReader, BsonWriter};
use crate::value::ElementType;

use super::context::SerializationContext;
use super::serializer::BsonSerializer;
use super::types::{AnyObject, GenericInstance, TypeKey};

/// Builds a serializer for instances of one generic definition
pub trait GenericTemplate: Send + Sync {
    /// Definition name, e.g. `"Vec"`
    fn definition(&self) -> &'static str;

    fn instantiate(&self, key: TypeKey, instance: &GenericInstance) -> Result<Arc<dyn BsonSerializer>>;
}

fn shape_of<S: Any + Clone>(key: TypeKey, instance: &GenericInstance) -> Result<S> {
    instance
        .shape
        .downcast_ref::<S>()
        .cloned()
        .ok_or_else(|| BsonError::type_mismatch(std::any::type_name::<S>(), key.short_name()))
}

fn element_mismatch(container: TypeKey) -> BsonError {
    BsonError::type_mismatch(container.short_name(), "a value of another type")
}

// ==================== Vec<T> ====================

#[derive(Clone, Copy)]
pub(crate) struct SequenceShape {
    element: TypeKey,
    create: fn() -> AnyObject,
    push: fn(&mut AnyObject, AnyObject) -> bool,
    items: for<'a> fn(&'a dyn Any) -> Option<Vec<&'a dyn Any>>,
}

impl SequenceShape {
    pub(crate) fn of<E: Any + Send>() -> Self {
        fn create<E: Any + Send>() -> AnyObject {
            Box::new(Vec::<E>::new())
        }
        fn push<E: Any + Send>(target: &mut AnyObject, item: AnyObject) -> bool {
            match (target.downcast_mut::<Vec<E>>(), item.downcast::<E>()) {
                (Some(vec), Ok(item)) => {
                    vec.push(*item);
                    true
                }
                _ => false,
            }
        }
        fn items<E: Any>(value: &dyn Any) -> Option<Vec<&dyn Any>> {
            value
                .downcast_ref::<Vec<E>>()
                .map(|v| v.iter().map(|e| e as &dyn Any).collect())
        }
        Self {
            element: TypeKey::of::<E>(),
            create: create::<E>,
            push: push::<E>,
            items: items::<E>,
        }
    }
}

pub struct SequenceTemplate;

impl GenericTemplate for SequenceTemplate {
    fn definition(&self) -> &'static str {
        "Vec"
    }

    fn instantiate(&self, key: TypeKey, instance: &GenericInstance) -> Result<Arc<dyn BsonSerializer>> {
        Ok(Arc::new(SequenceSerializer {
            key,
            shape: shape_of::<SequenceShape>(key, instance)?,
        }))
    }
}

struct SequenceSerializer {
    key: TypeKey,
    shape: SequenceShape,
}

impl BsonSerializer for SequenceSerializer {
    fn value_type(&self) -> TypeKey {
        self.key
    }

    fn serialize(
        &self,
        writer: &mut BsonWriter,
        _nominal: TypeKey,
        value: &dyn Any,
        ctx: &SerializationContext,
    ) -> Result<()> {
        let items = (self.shape.items)(value).ok_or_else(|| element_mismatch(self.key))?;
        writer.write_start_array()?;
        for item in items {
            ctx.serialize_nominal(writer, self.shape.element, item)?;
        }
        writer.write_end_array()
    }

    fn deserialize(
        &self,
        reader: &mut BsonReader<'_>,
        _nominal: TypeKey,
        ctx: &SerializationContext,
    ) -> Result<AnyObject> {
        let mut out = (self.shape.create)();
        reader.read_start_array()?;
        while reader.read_bson_type()?.is_some() {
            let item = ctx.deserialize_nominal(reader, self.shape.element)?;
            if !(self.shape.push)(&mut out, item) {
                return Err(element_mismatch(self.key));
            }
        }
        reader.read_end_array()?;
        Ok(out)
    }
}

// ==================== Option<T> ====================

#[derive(Clone, Copy)]
pub(crate) struct OptionShape {
    element: TypeKey,
    none: fn() -> AnyObject,
    some: fn(AnyObject) -> Option<AnyObject>,
    get: for<'a> fn(&'a dyn Any) -> Option<Option<&'a dyn Any>>,
}

impl OptionShape {
    pub(crate) fn of<E: Any + Send>() -> Self {
        fn none<E: Any + Send>() -> AnyObject {
            Box::new(None::<E>)
        }
        fn some<E: Any + Send>(item: AnyObject) -> Option<AnyObject> {
            item.downcast::<E>()
                .ok()
                .map(|v| Box::new(Some(*v)) as AnyObject)
        }
        fn get<E: Any>(value: &dyn Any) -> Option<Option<&dyn Any>> {
            value
                .downcast_ref::<Option<E>>()
                .map(|o| o.as_ref().map(|v| v as &dyn Any))
        }
        Self {
            element: TypeKey::of::<E>(),
            none: none::<E>,
            some: some::<E>,
            get: get::<E>,
        }
    }
}

pub struct OptionTemplate;

impl GenericTemplate for OptionTemplate {
    fn definition(&self) -> &'static str {
        "Option"
    }

    fn instantiate(&self, key: TypeKey, instance: &GenericInstance) -> Result<Arc<dyn BsonSerializer>> {
        Ok(Arc::new(OptionSerializer {
            key,
            shape: shape_of::<OptionShape>(key, instance)?,
        }))
    }
}

struct OptionSerializer {
    key: TypeKey,
    shape: OptionShape,
}

impl BsonSerializer for OptionSerializer {
    fn value_type(&self) -> TypeKey {
        self.key
    }

    fn serialize(
        &self,
        writer: &mut BsonWriter,
        _nominal: TypeKey,
        value: &dyn Any,
        ctx: &SerializationContext,
    ) -> Result<()> {
        match (self.shape.get)(value) {
            Some(Some(inner)) => ctx.serialize_nominal(writer, self.shape.element, inner),
            Some(None) => writer.write_null(),
            None => Err(element_mismatch(self.key)),
        }
    }

    fn deserialize(
        &self,
        reader: &mut BsonReader<'_>,
        _nominal: TypeKey,
        ctx: &SerializationContext,
    ) -> Result<AnyObject> {
        if reader.current_type() == Some(ElementType::Null) {
            reader.read_null()?;
            return Ok((self.shape.none)());
        }
        let inner = ctx.deserialize_nominal(reader, self.shape.element)?;
        (self.shape.some)(inner).ok_or_else(|| element_mismatch(self.key))
    }
}

// ==================== HashMap<String, T> ====================

#[derive(Clone, Copy)]
pub(crate) struct MapShape {
    value: TypeKey,
    create: fn() -> AnyObject,
    insert: fn(&mut AnyObject, String, AnyObject) -> bool,
    entries: for<'a> fn(&'a dyn Any) -> Option<Vec<(&'a str, &'a dyn Any)>>,
}

impl MapShape {
    pub(crate) fn of<E: Any + Send>() -> Self {
        fn create<E: Any + Send>() -> AnyObject {
            Box::new(HashMap::<String, E>::new())
        }
        fn insert<E: Any + Send>(target: &mut AnyObject, key: String, item: AnyObject) -> bool {
            match (target.downcast_mut::<HashMap<String, E>>(), item.downcast::<E>()) {
                (Some(map), Ok(item)) => {
                    map.insert(key, *item);
                    true
                }
                _ => false,
            }
        }
        fn entries<E: Any>(value: &dyn Any) -> Option<Vec<(&str, &dyn Any)>> {
            value.downcast_ref::<HashMap<String, E>>().map(|m| {
                let mut entries: Vec<(&str, &dyn Any)> =
                    m.iter().map(|(k, v)| (k.as_str(), v as &dyn Any)).collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                entries
            })
        }
        Self {
            value: TypeKey::of::<E>(),
            create: create::<E>,
            insert: insert::<E>,
            entries: entries::<E>,
        }
    }
}

pub struct MapTemplate;

impl GenericTemplate for MapTemplate {
    fn definition(&self) -> &'static str {
        "HashMap"
    }

    fn instantiate(&self, key: TypeKey, instance: &GenericInstance) -> Result<Arc<dyn BsonSerializer>> {
        Ok(Arc::new(MapSerializer {
            key,
            shape: shape_of::<MapShape>(key, instance)?,
        }))
    }
}

/// Writes entries in key order so output is deterministic
struct MapSerializer {
    key: TypeKey,
    shape: MapShape,
}

impl BsonSerializer for MapSerializer {
    fn value_type(&self) -> TypeKey {
        self.key
    }

    fn serialize(
        &self,
        writer: &mut BsonWriter,
        _nominal: TypeKey,
        value: &dyn Any,
        ctx: &SerializationContext,
    ) -> Result<()> {
        let entries = (self.shape.entries)(value).ok_or_else(|| element_mismatch(self.key))?;
        writer.write_start_document()?;
        for (name, item) in entries {
            writer.write_name(name)?;
            ctx.serialize_nominal(writer, self.shape.value, item)?;
        }
        writer.write_end_document()
    }

    fn deserialize(
        &self,
        reader: &mut BsonReader<'_>,
        _nominal: TypeKey,
        ctx: &SerializationContext,
    ) -> Result<AnyObject> {
        let mut out = (self.shape.create)();
        reader.read_start_document()?;
        while reader.read_bson_type()?.is_some() {
            let name = reader.read_name()?.to_string();
            let item = ctx.deserialize_nominal(reader, self.shape.value)?;
            if !(self.shape.insert)(&mut out, name, item) {
                return Err(element_mismatch(self.key));
            }
        }
        reader.read_end_document()?;
        Ok(out)
    }
}
