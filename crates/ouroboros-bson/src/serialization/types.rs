//! Type catalog
//!
//! Rust has no runtime reflection, so every type that takes part in
//! serialization is declared up front: its kind, discriminator, supertypes
//! (with the conversion into each), an optional unwrapper reaching the concrete
//! value behind a trait object, and the shape of generic instances such as
//! `Vec<T>`.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{BsonError, Result};
use crate::value::Bson;

use super::serializer::{BsonSerializable, BsonSerializer, SelfSerializer};
use super::templates::{MapShape, OptionShape, SequenceShape};

/// Universal nominal type: any value at all
pub type AnyObject = Box<dyn Any + Send>;

/// Runtime identity of a Rust type
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: Any + ?Sized>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Full path name, e.g. `alloc::vec::Vec<i32>`
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Name without the module path of the outermost type, e.g. `Vec<i32>`
    pub fn short_name(&self) -> &'static str {
        let head_end = self.name.find('<').unwrap_or(self.name.len());
        let start = self.name[..head_end]
            .rfind("::")
            .map(|i| i + 2)
            .unwrap_or(0);
        &self.name[start..]
    }

    pub fn any_object() -> Self {
        Self::of::<AnyObject>()
    }

    pub fn is_any_object(&self) -> bool {
        self.id == TypeId::of::<AnyObject>()
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// How a type participates in polymorphism
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Instantiable; has its own serializer
    Concrete,
    /// Never instantiated directly; values are always of a subtype
    Abstract,
    /// Trait-object nominal; implicitly discriminated
    Interface,
}

pub(crate) type UpcastFn = Arc<dyn Fn(AnyObject) -> Result<AnyObject> + Send + Sync>;

/// Reaches the concrete value behind an interface value
pub(crate) trait Unwrapper: Send + Sync {
    fn unwrap<'a>(&self, value: &'a dyn Any) -> Option<&'a dyn Any>;
}

struct Unwrap<T> {
    f: fn(&T) -> &dyn Any,
}

impl<T: Any> Unwrapper for Unwrap<T> {
    fn unwrap<'a>(&self, value: &'a dyn Any) -> Option<&'a dyn Any> {
        value.downcast_ref::<T>().map(|v| (self.f)(v))
    }
}

#[derive(Clone)]
pub(crate) struct Supertype {
    pub(crate) key: TypeKey,
    pub(crate) upcast: UpcastFn,
}

/// A concrete instantiation of a generic definition
#[derive(Clone)]
pub struct GenericInstance {
    pub definition: &'static str,
    pub arguments: Vec<TypeKey>,
    pub(crate) shape: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for GenericInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericInstance")
            .field("definition", &self.definition)
            .field("arguments", &self.arguments)
            .finish()
    }
}

/// Everything the catalog knows about one type
#[derive(Clone)]
pub struct TypeDescriptor {
    pub(crate) key: TypeKey,
    pub(crate) kind: TypeKind,
    pub(crate) discriminator: Option<Bson>,
    pub(crate) supertypes: Vec<Supertype>,
    pub(crate) root_class: bool,
    pub(crate) unwrapper: Option<Arc<dyn Unwrapper>>,
    pub(crate) generic: Option<GenericInstance>,
    pub(crate) serializer: Option<Arc<dyn BsonSerializer>>,
    pub(crate) self_serializing: bool,
}

impl TypeDescriptor {
    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn discriminator(&self) -> Option<&Bson> {
        self.discriminator.as_ref()
    }

    pub fn supertypes(&self) -> impl Iterator<Item = TypeKey> + '_ {
        self.supertypes.iter().map(|s| s.key)
    }

    pub fn is_root_class(&self) -> bool {
        self.root_class
    }

    pub fn generic(&self) -> Option<&GenericInstance> {
        self.generic.as_ref()
    }

    pub fn is_self_serializing(&self) -> bool {
        self.self_serializing
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("discriminator", &self.discriminator)
            .field("supertypes", &self.supertypes.iter().map(|s| s.key).collect::<Vec<_>>())
            .field("root_class", &self.root_class)
            .finish()
    }
}

/// Builder for a [`TypeDescriptor`]
pub struct TypeDeclaration<T> {
    descriptor: TypeDescriptor,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send> TypeDeclaration<T> {
    fn with_kind(kind: TypeKind) -> Self {
        let key = TypeKey::of::<T>();
        let discriminator = match kind {
            TypeKind::Interface => None,
            _ => Some(Bson::String(key.short_name().to_string())),
        };
        Self {
            descriptor: TypeDescriptor {
                key,
                kind,
                discriminator,
                supertypes: Vec::new(),
                root_class: false,
                unwrapper: None,
                generic: None,
                serializer: None,
                self_serializing: false,
            },
            _marker: PhantomData,
        }
    }

    /// An instantiable type; its discriminator defaults to its short name
    pub fn concrete() -> Self {
        Self::with_kind(TypeKind::Concrete)
    }

    pub fn abstract_type() -> Self {
        Self::with_kind(TypeKind::Abstract)
    }

    /// A trait-object nominal such as `Box<dyn Shape>`
    ///
    /// `unwrap` must return the concrete value held inside.
    pub fn interface(unwrap: fn(&T) -> &dyn Any) -> Self {
        let mut declaration = Self::with_kind(TypeKind::Interface);
        declaration.descriptor.unwrapper = Some(Arc::new(Unwrap::<T> { f: unwrap }));
        declaration
    }

    pub fn discriminator(mut self, value: impl Into<Bson>) -> Self {
        self.descriptor.discriminator = Some(value.into());
        self
    }

    /// Declare `N` as a supertype; `upcast` converts a `T` into an `N`
    pub fn extends<N: Any + Send>(mut self, upcast: fn(T) -> N) -> Self {
        let from = self.descriptor.key;
        let to = TypeKey::of::<N>();
        let f: UpcastFn = Arc::new(move |value: AnyObject| {
            value
                .downcast::<T>()
                .map(|v| Box::new(upcast(*v)) as AnyObject)
                .map_err(|_| BsonError::NotAssignable {
                    actual: from.short_name().to_string(),
                    nominal: to.short_name().to_string(),
                })
        });
        self.descriptor.supertypes.push(Supertype { key: to, upcast: f });
        self
    }

    /// Mark this type as the root of a hierarchical discriminator chain
    pub fn root_class(mut self) -> Self {
        self.descriptor.root_class = true;
        self
    }

    /// Serializer for this type, taking precedence over templates and providers
    pub fn with_serializer(mut self, serializer: Arc<dyn BsonSerializer>) -> Self {
        self.descriptor.serializer = Some(serializer);
        self
    }

    pub fn key(&self) -> TypeKey {
        self.descriptor.key
    }

    pub(crate) fn no_discriminator(mut self) -> Self {
        self.descriptor.discriminator = None;
        self
    }

    pub(crate) fn into_descriptor(self) -> TypeDescriptor {
        self.descriptor
    }
}

impl<T: BsonSerializable> TypeDeclaration<T> {
    /// A type that serializes itself; its serializer cannot be overridden
    pub fn self_serializing() -> Self {
        let mut declaration = Self::concrete();
        declaration.descriptor.self_serializing = true;
        declaration.descriptor.serializer = Some(Arc::new(SelfSerializer::<T>::new()));
        declaration
    }
}

impl<E: Any + Send> TypeDeclaration<Vec<E>> {
    /// `Vec<E>` as an instance of the `Vec` template
    pub fn sequence() -> Self {
        let mut declaration = Self::concrete();
        declaration.descriptor.generic = Some(GenericInstance {
            definition: "Vec",
            arguments: vec![TypeKey::of::<E>()],
            shape: Arc::new(SequenceShape::of::<E>()),
        });
        declaration
    }
}

impl<E: Any + Send> TypeDeclaration<Option<E>> {
    /// `Option<E>` as an instance of the `Option` template
    pub fn optional() -> Self {
        let mut declaration = Self::concrete();
        declaration.descriptor.generic = Some(GenericInstance {
            definition: "Option",
            arguments: vec![TypeKey::of::<E>()],
            shape: Arc::new(OptionShape::of::<E>()),
        });
        declaration
    }
}

impl<E: Any + Send> TypeDeclaration<HashMap<String, E>> {
    /// `HashMap<String, E>` as an instance of the `HashMap` template
    pub fn string_map() -> Self {
        let mut declaration = Self::concrete();
        declaration.descriptor.generic = Some(GenericInstance {
            definition: "HashMap",
            arguments: vec![TypeKey::of::<String>(), TypeKey::of::<E>()],
            shape: Arc::new(MapShape::of::<E>()),
        });
        declaration
    }
}

/// All declared types; immutable once the context is built
#[derive(Default)]
pub struct TypeCatalog {
    types: HashMap<TypeKey, TypeDescriptor>,
    by_id: HashMap<TypeId, TypeKey>,
}

impl TypeCatalog {
    pub(crate) fn insert(&mut self, descriptor: TypeDescriptor) -> Result<()> {
        let key = descriptor.key;
        if self.types.contains_key(&key) {
            return Err(BsonError::DuplicateDeclaration(key.short_name().to_string()));
        }
        self.by_id.insert(key.id(), key);
        self.types.insert(key, descriptor);
        Ok(())
    }

    pub fn contains(&self, key: TypeKey) -> bool {
        self.types.contains_key(&key)
    }

    pub fn get(&self, key: TypeKey) -> Option<&TypeDescriptor> {
        self.types.get(&key)
    }

    pub fn key_for_id(&self, id: TypeId) -> Option<TypeKey> {
        self.by_id.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Find a declared type by its full or short name
    pub fn find_by_name(&self, name: &str) -> Option<TypeKey> {
        if let Some(desc) = self.types.values().find(|d| d.key.name() == name) {
            return Some(desc.key);
        }
        let mut matches = self.types.values().filter(|d| d.key.short_name() == name);
        match (matches.next(), matches.next()) {
            (Some(desc), None) => Some(desc.key),
            _ => None,
        }
    }

    /// Reflexive-transitive closure of the declared supertype links
    ///
    /// Every type is assignable to [`AnyObject`].
    pub fn is_assignable(&self, actual: TypeKey, nominal: TypeKey) -> bool {
        if actual == nominal || nominal.is_any_object() {
            return true;
        }
        self.ancestors(actual).contains(&nominal)
    }

    /// Supertypes of `key`, nearest first, without `key` itself
    pub fn ancestors(&self, key: TypeKey) -> Vec<TypeKey> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([key]);
        seen.insert(key);
        while let Some(current) = queue.pop_front() {
            if let Some(desc) = self.types.get(&current) {
                for parent in desc.supertypes() {
                    if seen.insert(parent) {
                        order.push(parent);
                        queue.push_back(parent);
                    }
                }
            }
        }
        order
    }

    /// Declared types assignable to `nominal`, excluding `nominal`
    pub fn known_subtypes(&self, nominal: TypeKey) -> Vec<TypeKey> {
        let mut keys: Vec<TypeKey> = self
            .types
            .keys()
            .copied()
            .filter(|k| *k != nominal && self.is_assignable(*k, nominal))
            .collect();
        keys.sort_by_key(|k| k.name());
        keys
    }

    /// Whether values of `nominal` may carry a discriminator
    pub fn is_discriminated(&self, nominal: TypeKey) -> bool {
        if nominal.is_any_object() {
            return true;
        }
        match self.types.get(&nominal) {
            Some(desc) if desc.kind != TypeKind::Concrete => true,
            Some(_) => self
                .types
                .values()
                .any(|d| d.key != nominal && self.ancestors(d.key).contains(&nominal)),
            None => false,
        }
    }

    /// `key` followed by its first-declared supertype, repeatedly
    pub fn class_chain(&self, key: TypeKey) -> Vec<TypeKey> {
        let mut chain = vec![key];
        let mut current = key;
        while let Some(parent) = self
            .types
            .get(&current)
            .and_then(|d| d.supertypes.first())
            .map(|s| s.key)
        {
            if chain.contains(&parent) {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// Convert a value of `actual` into a value of `nominal`
    pub fn upcast(&self, value: AnyObject, actual: TypeKey, nominal: TypeKey) -> Result<AnyObject> {
        if actual == nominal {
            return Ok(value);
        }
        if nominal.is_any_object() {
            return Ok(Box::new(value) as AnyObject);
        }
        let path = self.upcast_path(actual, nominal).ok_or_else(|| BsonError::NotAssignable {
            actual: actual.short_name().to_string(),
            nominal: nominal.short_name().to_string(),
        })?;
        path.iter().try_fold(value, |acc, step| step(acc))
    }

    fn upcast_path(&self, actual: TypeKey, nominal: TypeKey) -> Option<Vec<UpcastFn>> {
        let mut previous: HashMap<TypeKey, (TypeKey, UpcastFn)> = HashMap::new();
        let mut queue = VecDeque::from([actual]);
        while let Some(current) = queue.pop_front() {
            if current == nominal {
                let mut steps = Vec::new();
                let mut at = nominal;
                while at != actual {
                    let (from, f) = previous.get(&at)?;
                    steps.push(f.clone());
                    at = *from;
                }
                steps.reverse();
                return Some(steps);
            }
            let Some(desc) = self.types.get(&current) else {
                continue;
            };
            for parent in &desc.supertypes {
                if parent.key != actual && !previous.contains_key(&parent.key) {
                    previous.insert(parent.key, (current, parent.upcast.clone()));
                    queue.push_back(parent.key);
                }
            }
        }
        None
    }

    pub(crate) fn unwrapper(&self, key: TypeKey) -> Option<&Arc<dyn Unwrapper>> {
        self.types.get(&key).and_then(|d| d.unwrapper.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.types.values()
    }
}
