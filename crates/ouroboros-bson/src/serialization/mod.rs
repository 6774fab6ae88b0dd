//! Typed serialization on top of the raw codec
//!
//! - [`types`]: the type catalog (kinds, supertypes, discriminators)
//! - [`registry`]: serializer lookup and caching
//! - [`discriminator`]: polymorphic type tags
//! - [`context`]: the entry point tying them together

pub mod class_map;
pub mod context;
pub mod discriminator;
pub mod id_generator;
pub mod primitives;
pub mod registry;
pub mod serializer;
pub mod templates;
pub mod types;

pub use class_map::{ClassMap, ClassMapSerializer, ID_ELEMENT_NAME};
pub use context::{SerializationContext, SerializationContextBuilder};
pub use discriminator::{
    DiscriminatorConvention, HierarchicalDiscriminatorConvention, ScalarDiscriminatorConvention,
    DEFAULT_ELEMENT_NAME,
};
pub use id_generator::{
    AscendingUuidGenerator, IdGenerator, NullIdChecker, ObjectIdGenerator, UuidGenerator, ZeroIdChecker,
};
pub use primitives::DefaultSerializationProvider;
pub use registry::{SerializationProvider, SerializerRegistry};
pub use serializer::{typed, BsonSerializable, BsonSerializer, IdProvider, TypedSerializer};
pub use templates::{GenericTemplate, MapTemplate, OptionTemplate, SequenceTemplate};
pub use types::{AnyObject, GenericInstance, TypeCatalog, TypeDeclaration, TypeDescriptor, TypeKey, TypeKind};
