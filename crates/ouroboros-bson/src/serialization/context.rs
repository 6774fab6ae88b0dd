//! Serialization context
//!
//! One context holds the type catalog, the serializer registry, discriminator
//! conventions and id generators. It is assembled once through
//! [`SerializationContextBuilder`] and then shared; lookups after that point
//! only ever add cache entries.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::datetime::DateTime;
use crate::document::Document;
use crate::error::{BsonError, Result};
use crate::oid::ObjectId;
use crate::raw::{BsonReader, BsonWriter};
use crate::value::Bson;

use super::class_map::ClassMap;
use super::discriminator::{DiscriminatorConvention, ScalarDiscriminatorConvention};
use super::id_generator::{IdGenerator, NullIdChecker, ObjectIdGenerator, UuidGenerator};
use super::primitives::DefaultSerializationProvider;
use super::registry::{SerializationProvider, SerializerRegistry};
use super::serializer::BsonSerializer;
use super::templates::{GenericTemplate, MapTemplate, OptionTemplate, SequenceTemplate};
use super::types::{AnyObject, TypeCatalog, TypeDeclaration, TypeDescriptor, TypeKey};

pub struct SerializationContext {
    catalog: TypeCatalog,
    registry: SerializerRegistry,
    conventions: HashMap<TypeKey, Arc<dyn DiscriminatorConvention>>,
    convention_cache: RwLock<HashMap<TypeKey, Arc<dyn DiscriminatorConvention>>>,
    default_convention: Arc<dyn DiscriminatorConvention>,
    id_generators: HashMap<TypeKey, Arc<dyn IdGenerator>>,
}

impl SerializationContext {
    pub fn builder() -> SerializationContextBuilder {
        SerializationContextBuilder::new()
    }

    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &SerializerRegistry {
        &self.registry
    }

    pub fn lookup(&self, key: TypeKey) -> Result<Arc<dyn BsonSerializer>> {
        self.registry.lookup(key, &self.catalog)
    }

    pub fn lookup_for<T: Any>(&self) -> Result<Arc<dyn BsonSerializer>> {
        self.lookup(TypeKey::of::<T>())
    }

    /// Register a serializer after the context is built
    ///
    /// Fails once a serializer for `T` has been handed out.
    pub fn register_serializer<T: Any>(&self, serializer: Arc<dyn BsonSerializer>) -> Result<()> {
        self.registry.register(TypeKey::of::<T>(), serializer, &self.catalog)
    }

    /// Convention for `key`: its own, else the nearest ancestor's, else the default
    pub fn lookup_discriminator_convention(&self, key: TypeKey) -> Arc<dyn DiscriminatorConvention> {
        if let Some(convention) = self.convention_cache.read().get(&key) {
            return convention.clone();
        }
        let convention = self
            .conventions
            .get(&key)
            .or_else(|| {
                self.catalog
                    .ancestors(key)
                    .iter()
                    .find_map(|ancestor| self.conventions.get(ancestor))
            })
            .cloned()
            .unwrap_or_else(|| self.default_convention.clone());
        self.convention_cache
            .write()
            .entry(key)
            .or_insert(convention)
            .clone()
    }

    pub fn lookup_id_generator(&self, id_type: TypeKey) -> Option<Arc<dyn IdGenerator>> {
        self.id_generators.get(&id_type).cloned()
    }

    /// Declared type carrying `discriminator` that can stand in for `nominal`
    pub fn lookup_actual_type(&self, nominal: TypeKey, discriminator: &Bson) -> Result<TypeKey> {
        let mut candidates: Vec<TypeKey> = self
            .catalog
            .iter()
            .filter(|d| d.discriminator() == Some(discriminator))
            .map(TypeDescriptor::key)
            .filter(|k| self.catalog.is_assignable(*k, nominal))
            .collect();
        match candidates.len() {
            1 => return Ok(candidates[0]),
            0 => {}
            _ => {
                candidates.sort_by_key(|k| k.name());
                return Err(BsonError::AmbiguousDiscriminator {
                    discriminator: discriminator.to_string(),
                    nominal: nominal.short_name().to_string(),
                    candidates: candidates
                        .iter()
                        .map(|k| k.short_name())
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        }

        // a string tag may name the type itself
        if let Some(name) = discriminator.as_str() {
            if let Some(key) = self.catalog.find_by_name(name) {
                if self.catalog.is_assignable(key, nominal) {
                    return Ok(key);
                }
                return Err(BsonError::NotAssignable {
                    actual: key.short_name().to_string(),
                    nominal: nominal.short_name().to_string(),
                });
            }
        }
        Err(BsonError::UnknownDiscriminator {
            discriminator: discriminator.to_string(),
            nominal: nominal.short_name().to_string(),
        })
    }

    /// Write `value` at a position declared as `nominal`
    ///
    /// `value` is either of the nominal type itself or, for interface
    /// nominals, the wrapper around a concrete value.
    pub fn serialize_nominal(&self, writer: &mut BsonWriter, nominal: TypeKey, value: &dyn Any) -> Result<()> {
        let value = match self.catalog.unwrapper(nominal) {
            Some(unwrapper) if (*value).type_id() == nominal.id() => {
                unwrapper.unwrap(value).ok_or_else(|| {
                    BsonError::type_mismatch(nominal.short_name(), "a value of another type")
                })?
            }
            _ => value,
        };

        let actual = if (*value).type_id() == nominal.id() {
            nominal
        } else {
            let actual = self
                .catalog
                .key_for_id((*value).type_id())
                .ok_or_else(|| BsonError::UndeclaredType(format!("a value stored as {}", nominal)))?;
            if !self.catalog.is_assignable(actual, nominal) {
                return Err(BsonError::NotAssignable {
                    actual: actual.short_name().to_string(),
                    nominal: nominal.short_name().to_string(),
                });
            }
            actual
        };

        self.lookup(actual)?.serialize(writer, nominal, value, self)
    }

    /// Read the value at the reader's position as a `nominal`
    ///
    /// The discriminator convention picks the actual type; the result is
    /// converted back up to `nominal`.
    pub fn deserialize_nominal(&self, reader: &mut BsonReader<'_>, nominal: TypeKey) -> Result<AnyObject> {
        let convention = self.lookup_discriminator_convention(nominal);
        let actual = convention.get_actual_type(reader, nominal, self)?;
        let value = self.lookup(actual)?.deserialize(reader, nominal, self)?;
        self.catalog.upcast(value, actual, nominal)
    }

    pub fn serialize<T: Any>(&self, writer: &mut BsonWriter, value: &T) -> Result<()> {
        self.serialize_nominal(writer, TypeKey::of::<T>(), value)
    }

    pub fn deserialize<T: Any>(&self, reader: &mut BsonReader<'_>) -> Result<T> {
        let value = self.deserialize_nominal(reader, TypeKey::of::<T>())?;
        value
            .downcast::<T>()
            .map(|v| *v)
            .map_err(|_| BsonError::type_mismatch(TypeKey::of::<T>().short_name(), "a value of another type"))
    }

    /// Encode `value` as a standalone document
    pub fn to_vec<T: Any>(&self, value: &T) -> Result<Vec<u8>> {
        let mut writer = BsonWriter::new();
        self.serialize(&mut writer, value)?;
        writer.into_bytes()
    }

    /// Decode exactly one document; trailing bytes are an error
    pub fn from_slice<T: Any>(&self, bytes: &[u8]) -> Result<T> {
        let mut reader = BsonReader::new(bytes);
        let value = self.deserialize(&mut reader)?;
        if reader.position() != bytes.len() {
            return Err(BsonError::LengthMismatch(format!(
                "document occupies {} bytes but buffer holds {}",
                reader.position(),
                bytes.len()
            )));
        }
        Ok(value)
    }

    pub fn to_document<T: Any>(&self, value: &T) -> Result<Document> {
        Document::from_slice(&self.to_vec(value)?)
    }

    pub fn from_document<T: Any>(&self, document: &Document) -> Result<T> {
        self.from_slice(&document.to_vec()?)
    }

    /// Current id of `value`, if its serializer knows an id member
    pub fn get_document_id<'a, T: Any>(&self, value: &'a T) -> Result<Option<(TypeKey, &'a dyn Any)>> {
        let serializer = self.lookup_for::<T>()?;
        match serializer.id_provider() {
            Some(provider) => provider.get_document_id(value),
            None => Ok(None),
        }
    }

    /// Assign a generated id when the current one is empty
    ///
    /// Returns `true` if an id was generated.
    pub fn ensure_document_id<T: Any>(&self, value: &mut T) -> Result<bool> {
        let serializer = self.lookup_for::<T>()?;
        let Some(provider) = serializer.id_provider() else {
            return Ok(false);
        };
        let generator = {
            let Some((id_type, id)) = provider.get_document_id(&*value)? else {
                return Ok(false);
            };
            let Some(generator) = provider
                .id_generator()
                .or_else(|| self.lookup_id_generator(id_type))
            else {
                return Ok(false);
            };
            if !generator.is_empty(id) {
                return Ok(false);
            }
            generator
        };
        provider.set_document_id(value, generator.generate()?)?;
        debug!(type_name = %TypeKey::of::<T>(), "generated document id");
        Ok(true)
    }
}

struct ClassMapEntry {
    key: TypeKey,
    serializer: Arc<dyn BsonSerializer>,
    declare: fn() -> TypeDescriptor,
}

fn concrete_descriptor<T: Any + Send>() -> TypeDescriptor {
    TypeDeclaration::<T>::concrete().into_descriptor()
}

/// Assembles a [`SerializationContext`]
///
/// Declaration errors are collected and reported by [`build`](Self::build).
pub struct SerializationContextBuilder {
    descriptors: HashMap<TypeKey, TypeDescriptor>,
    class_maps: Vec<ClassMapEntry>,
    serializers: Vec<(TypeKey, Arc<dyn BsonSerializer>)>,
    providers: Vec<Arc<dyn SerializationProvider>>,
    templates: Vec<Arc<dyn GenericTemplate>>,
    conventions: HashMap<TypeKey, Arc<dyn DiscriminatorConvention>>,
    default_convention: Arc<dyn DiscriminatorConvention>,
    id_generators: HashMap<TypeKey, Arc<dyn IdGenerator>>,
    error: Option<BsonError>,
}

impl SerializationContextBuilder {
    pub fn new() -> Self {
        let mut id_generators: HashMap<TypeKey, Arc<dyn IdGenerator>> = HashMap::new();
        id_generators.insert(TypeKey::of::<ObjectId>(), Arc::new(ObjectIdGenerator));
        id_generators.insert(TypeKey::of::<uuid::Uuid>(), Arc::new(UuidGenerator));
        id_generators.insert(TypeKey::of::<Bson>(), Arc::new(NullIdChecker));
        Self {
            descriptors: HashMap::new(),
            class_maps: Vec::new(),
            serializers: Vec::new(),
            providers: Vec::new(),
            templates: Vec::new(),
            conventions: HashMap::new(),
            default_convention: Arc::new(ScalarDiscriminatorConvention::default()),
            id_generators,
            error: None,
        }
    }

    pub fn declare<T: Any + Send>(mut self, declaration: TypeDeclaration<T>) -> Self {
        self.insert_descriptor(declaration.into_descriptor());
        self
    }

    /// Serialize `T` through a member map; declares `T` as concrete if needed
    pub fn class_map<T: Any + Send + Default>(mut self, map: ClassMap<T>) -> Self {
        self.class_maps.push(ClassMapEntry {
            key: TypeKey::of::<T>(),
            serializer: map.into_serializer(),
            declare: concrete_descriptor::<T>,
        });
        self
    }

    pub fn register_serializer<T: Any>(mut self, serializer: Arc<dyn BsonSerializer>) -> Self {
        self.serializers.push((TypeKey::of::<T>(), serializer));
        self
    }

    /// Providers registered later are consulted first
    pub fn register_provider(mut self, provider: Arc<dyn SerializationProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn register_template(mut self, template: Arc<dyn GenericTemplate>) -> Self {
        self.templates.push(template);
        self
    }

    /// Convention for `N` and every type that extends it
    pub fn register_discriminator_convention<N: Any>(mut self, convention: Arc<dyn DiscriminatorConvention>) -> Self {
        let key = TypeKey::of::<N>();
        if self.conventions.insert(key, convention).is_some() {
            self.fail(BsonError::DuplicateDeclaration(format!("discriminator convention for {}", key)));
        }
        self
    }

    pub fn default_discriminator_convention(mut self, convention: Arc<dyn DiscriminatorConvention>) -> Self {
        self.default_convention = convention;
        self
    }

    /// Default generator for ids of type `T`
    pub fn register_id_generator<T: Any>(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generators.insert(TypeKey::of::<T>(), generator);
        self
    }

    pub fn build(mut self) -> Result<Arc<SerializationContext>> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        self.declare_builtins();

        for entry in std::mem::take(&mut self.class_maps) {
            let descriptor = self.descriptors.entry(entry.key).or_insert_with(entry.declare);
            if descriptor.serializer.is_some() {
                return Err(BsonError::DuplicateSerializer(entry.key.short_name().to_string()));
            }
            descriptor.serializer = Some(entry.serializer);
        }

        let mut catalog = TypeCatalog::default();
        for (_, descriptor) in self.descriptors.drain() {
            catalog.insert(descriptor)?;
        }

        let mut templates: Vec<Arc<dyn GenericTemplate>> =
            vec![Arc::new(SequenceTemplate), Arc::new(OptionTemplate), Arc::new(MapTemplate)];
        templates.extend(self.templates);

        let mut providers: Vec<Arc<dyn SerializationProvider>> = vec![Arc::new(DefaultSerializationProvider::new())];
        providers.extend(self.providers);

        let registry = SerializerRegistry::new(templates, providers);
        for (key, serializer) in self.serializers {
            registry.register(key, serializer, &catalog)?;
        }

        debug!(types = catalog.len(), "serialization context built");
        Ok(Arc::new(SerializationContext {
            catalog,
            registry,
            conventions: self.conventions,
            convention_cache: RwLock::new(HashMap::new()),
            default_convention: self.default_convention,
            id_generators: self.id_generators,
        }))
    }

    fn fail(&mut self, err: BsonError) {
        self.error.get_or_insert(err);
    }

    fn insert_descriptor(&mut self, descriptor: TypeDescriptor) {
        let key = descriptor.key();
        if self.descriptors.contains_key(&key) {
            self.fail(BsonError::DuplicateDeclaration(key.short_name().to_string()));
            return;
        }
        self.descriptors.insert(key, descriptor);
    }

    fn declare_default(&mut self, descriptor: TypeDescriptor) {
        self.descriptors.entry(descriptor.key()).or_insert(descriptor);
    }

    fn declare_builtins(&mut self) {
        fn scalar<T: Any + Send>() -> TypeDescriptor {
            TypeDeclaration::<T>::concrete().no_discriminator().into_descriptor()
        }
        fn containers<T: Any + Send>() -> [TypeDescriptor; 2] {
            [
                TypeDeclaration::<Vec<T>>::sequence().no_discriminator().into_descriptor(),
                TypeDeclaration::<Option<T>>::optional().no_discriminator().into_descriptor(),
            ]
        }

        self.declare_default(TypeDeclaration::<AnyObject>::interface(|v| &**v).into_descriptor());
        for descriptor in [
            scalar::<bool>(),
            scalar::<i32>(),
            scalar::<i64>(),
            scalar::<f64>(),
            scalar::<String>(),
            scalar::<ObjectId>(),
            scalar::<DateTime>(),
            scalar::<uuid::Uuid>(),
            scalar::<Vec<u8>>(),
            scalar::<Bson>(),
            scalar::<Document>(),
        ] {
            self.declare_default(descriptor);
        }
        let generic = [
            containers::<bool>(),
            containers::<i32>(),
            containers::<i64>(),
            containers::<f64>(),
            containers::<String>(),
            containers::<ObjectId>(),
            containers::<DateTime>(),
            containers::<uuid::Uuid>(),
            containers::<Bson>(),
            containers::<Document>(),
        ];
        for descriptor in generic.into_iter().flatten() {
            self.declare_default(descriptor);
        }
        self.declare_default(TypeDeclaration::<Option<Vec<u8>>>::optional().no_discriminator().into_descriptor());
        self.declare_default(
            TypeDeclaration::<HashMap<String, Bson>>::string_map()
                .no_discriminator()
                .into_descriptor(),
        );
    }
}

impl Default for SerializationContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
