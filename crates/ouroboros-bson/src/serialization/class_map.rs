//! Member maps for struct types

use std::any::Any;
use std::sync::Arc;

use crate::error::{BsonError, Result};
use crate::raw::{BsonReader, BsonWriter};

use super::context::SerializationContext;
use super::id_generator::IdGenerator;
use super::serializer::{downcast_value, BsonSerializer, IdProvider};
use super::types::{AnyObject, TypeKey};

pub const ID_ELEMENT_NAME: &str = "_id";

/// Typed access to one field of `T`
trait MemberAccess<T>: Send + Sync {
    fn element_name(&self) -> &str;
    fn member_type(&self) -> TypeKey;
    fn get<'a>(&self, target: &'a T) -> &'a dyn Any;
    fn set(&self, target: &mut T, value: AnyObject) -> Result<()>;
}

struct Member<T, F> {
    element_name: String,
    get: fn(&T) -> &F,
    set: fn(&mut T, F),
}

impl<T: 'static, F: Any + Send> MemberAccess<T> for Member<T, F> {
    fn element_name(&self) -> &str {
        &self.element_name
    }

    fn member_type(&self) -> TypeKey {
        TypeKey::of::<F>()
    }

    fn get<'a>(&self, target: &'a T) -> &'a dyn Any {
        (self.get)(target)
    }

    fn set(&self, target: &mut T, value: AnyObject) -> Result<()> {
        let value = value.downcast::<F>().map_err(|_| {
            BsonError::type_mismatch(TypeKey::of::<F>().short_name(), "a value of another type")
        })?;
        (self.set)(target, *value);
        Ok(())
    }
}

/// Describes how the fields of `T` map to document elements
///
/// ```
/// use ouroboros_bson::serialization::ClassMap;
/// use ouroboros_bson::ObjectId;
///
/// #[derive(Default)]
/// struct Person { id: ObjectId, name: String }
///
/// let map = ClassMap::<Person>::new()
///     .id_member(|p| &p.id, |p, v| p.id = v)
///     .member("name", |p| &p.name, |p, v| p.name = v);
/// assert_eq!(map.element_names(), vec!["_id", "name"]);
/// ```
pub struct ClassMap<T> {
    members: Vec<Box<dyn MemberAccess<T>>>,
    id_member: Option<Box<dyn MemberAccess<T>>>,
    id_generator: Option<Arc<dyn IdGenerator>>,
    ignore_extra_elements: bool,
    discriminator_is_required: bool,
}

impl<T: Any + Send + Default> ClassMap<T> {
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
            id_member: None,
            id_generator: None,
            ignore_extra_elements: false,
            discriminator_is_required: false,
        }
    }

    pub fn member<F: Any + Send>(
        mut self,
        element_name: impl Into<String>,
        get: fn(&T) -> &F,
        set: fn(&mut T, F),
    ) -> Self {
        self.members.push(Box::new(Member {
            element_name: element_name.into(),
            get,
            set,
        }));
        self
    }

    /// The `_id` member; always written first
    pub fn id_member<F: Any + Send>(mut self, get: fn(&T) -> &F, set: fn(&mut T, F)) -> Self {
        self.id_member = Some(Box::new(Member {
            element_name: ID_ELEMENT_NAME.to_string(),
            get,
            set,
        }));
        self
    }

    pub fn id_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(generator);
        self
    }

    /// Skip unknown elements instead of failing
    pub fn ignore_extra_elements(mut self, ignore: bool) -> Self {
        self.ignore_extra_elements = ignore;
        self
    }

    /// Write the discriminator even when the actual type equals the nominal type
    pub fn discriminator_is_required(mut self, required: bool) -> Self {
        self.discriminator_is_required = required;
        self
    }

    pub fn element_names(&self) -> Vec<&str> {
        self.id_member
            .iter()
            .chain(self.members.iter())
            .map(|m| m.element_name())
            .collect()
    }

    pub fn into_serializer(self) -> Arc<dyn BsonSerializer> {
        Arc::new(ClassMapSerializer { map: self })
    }

    fn find_member(&self, name: &str) -> Option<&dyn MemberAccess<T>> {
        self.id_member
            .iter()
            .chain(self.members.iter())
            .find(|m| m.element_name() == name)
            .map(|m| m.as_ref())
    }
}

impl<T: Any + Send + Default> Default for ClassMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializer driven by a [`ClassMap`]
pub struct ClassMapSerializer<T> {
    map: ClassMap<T>,
}

impl<T: Any + Send + Default> BsonSerializer for ClassMapSerializer<T> {
    fn value_type(&self) -> TypeKey {
        TypeKey::of::<T>()
    }

    fn serialize(
        &self,
        writer: &mut BsonWriter,
        nominal: TypeKey,
        value: &dyn Any,
        ctx: &SerializationContext,
    ) -> Result<()> {
        let target = downcast_value::<T>(value)?;
        let actual = TypeKey::of::<T>();
        writer.write_start_document()?;

        if let Some(id) = &self.map.id_member {
            writer.write_name(id.element_name())?;
            ctx.serialize_nominal(writer, id.member_type(), id.get(target))?;
        }

        if actual != nominal || self.map.discriminator_is_required {
            let convention = ctx.lookup_discriminator_convention(nominal);
            if let Some(tag) = convention.get_discriminator(nominal, actual, ctx)? {
                writer.write_name(convention.element_name())?;
                writer.write_value(&tag)?;
            }
        }

        for member in &self.map.members {
            writer.write_name(member.element_name())?;
            ctx.serialize_nominal(writer, member.member_type(), member.get(target))?;
        }
        writer.write_end_document()
    }

    fn deserialize(
        &self,
        reader: &mut BsonReader<'_>,
        nominal: TypeKey,
        ctx: &SerializationContext,
    ) -> Result<AnyObject> {
        let convention = ctx.lookup_discriminator_convention(nominal);
        let mut target = T::default();
        reader.read_start_document()?;
        while reader.read_bson_type()?.is_some() {
            let name = reader.read_name()?.to_string();
            if name == convention.element_name() {
                reader.skip_value()?;
                continue;
            }
            match self.map.find_member(&name) {
                Some(member) => {
                    let value = ctx.deserialize_nominal(reader, member.member_type())?;
                    member.set(&mut target, value)?;
                }
                None if self.map.ignore_extra_elements => reader.skip_value()?,
                None => {
                    return Err(BsonError::UnexpectedElement {
                        element: name,
                        type_name: TypeKey::of::<T>().short_name().to_string(),
                    })
                }
            }
        }
        reader.read_end_document()?;
        Ok(Box::new(target))
    }

    fn id_provider(&self) -> Option<&dyn IdProvider> {
        self.map.id_member.as_ref().map(|_| self as &dyn IdProvider)
    }
}

impl<T: Any + Send + Default> IdProvider for ClassMapSerializer<T> {
    fn get_document_id<'a>(&self, document: &'a dyn Any) -> Result<Option<(TypeKey, &'a dyn Any)>> {
        let Some(id) = &self.map.id_member else {
            return Ok(None);
        };
        let target = downcast_value::<T>(document)?;
        Ok(Some((id.member_type(), id.get(target))))
    }

    fn set_document_id(&self, document: &mut dyn Any, value: AnyObject) -> Result<()> {
        let id = self
            .map
            .id_member
            .as_ref()
            .ok_or_else(|| BsonError::Id(format!("{} has no id member", TypeKey::of::<T>())))?;
        let target = document.downcast_mut::<T>().ok_or_else(|| {
            BsonError::type_mismatch(TypeKey::of::<T>().short_name(), "a value of another type")
        })?;
        id.set(target, value)
    }

    fn id_generator(&self) -> Option<Arc<dyn IdGenerator>> {
        self.map.id_generator.clone()
    }
}
