//! Discriminator conventions
//!
//! A convention names the element that carries the type tag and decides
//! which tag to write for a concrete type and which type a tag denotes.

use tracing::trace;

use crate::document::Document;
use crate::error::{BsonError, Result};
use crate::raw::{BsonReader, ReaderState};
use crate::value::{Bson, ElementType};

use super::context::SerializationContext;
use super::primitives::primitive_type_for;
use super::types::TypeKey;

pub const DEFAULT_ELEMENT_NAME: &str = "_t";

pub trait DiscriminatorConvention: Send + Sync {
    /// Element holding the discriminator, e.g. `_t`
    fn element_name(&self) -> &str;

    /// Tag to write for a value of `actual` stored at a `nominal` position
    fn get_discriminator(
        &self,
        nominal: TypeKey,
        actual: TypeKey,
        ctx: &SerializationContext,
    ) -> Result<Option<Bson>>;

    /// Type to instantiate for the value at the reader's position
    ///
    /// The reader is left exactly where it was.
    fn get_actual_type(
        &self,
        reader: &mut BsonReader<'_>,
        nominal: TypeKey,
        ctx: &SerializationContext,
    ) -> Result<TypeKey> {
        resolve_actual_type(self.element_name(), reader, nominal, ctx)
    }
}

fn resolve_actual_type(
    element_name: &str,
    reader: &mut BsonReader<'_>,
    nominal: TypeKey,
    ctx: &SerializationContext,
) -> Result<TypeKey> {
    let wire = match reader.state() {
        ReaderState::Initial => ElementType::Document,
        _ => reader
            .current_type()
            .ok_or_else(|| BsonError::InvalidState {
                component: "reader",
                message: "no value to resolve a type for".to_string(),
            })?,
    };
    let catalog = ctx.catalog();

    if let Some(primitive) = primitive_type_for(wire, reader)? {
        if primitive == nominal {
            return Ok(nominal);
        }
        if catalog.is_assignable(primitive, nominal) {
            return Ok(primitive);
        }
    }

    if wire == ElementType::Document && catalog.is_discriminated(nominal) {
        if let Some(tag) = peek_discriminator(element_name, reader)? {
            let tag = match tag {
                // hierarchical tags: the leaf is authoritative
                Bson::Array(mut items) => items.pop().ok_or_else(|| BsonError::UnknownDiscriminator {
                    discriminator: "[]".to_string(),
                    nominal: nominal.short_name().to_string(),
                })?,
                other => other,
            };
            let actual = ctx.lookup_actual_type(nominal, &tag)?;
            trace!(nominal = %nominal, actual = %actual, discriminator = %tag, "resolved discriminator");
            return Ok(actual);
        }
    }

    if nominal.is_any_object() {
        return Ok(match wire {
            ElementType::Document => TypeKey::of::<Document>(),
            _ => TypeKey::of::<Bson>(),
        });
    }
    Ok(nominal)
}

/// Read the discriminator element of the upcoming document without consuming it
fn peek_discriminator(element_name: &str, reader: &mut BsonReader<'_>) -> Result<Option<Bson>> {
    let bookmark = reader.bookmark();
    let result = scan_for_element(element_name, reader);
    reader.return_to_bookmark(&bookmark);
    result
}

fn scan_for_element(element_name: &str, reader: &mut BsonReader<'_>) -> Result<Option<Bson>> {
    reader.read_start_document()?;
    match reader.find_element(element_name)? {
        Some(_) => reader.read_value().map(Some),
        None => Ok(None),
    }
}

/// Single tag per type, written under `_t` by default
pub struct ScalarDiscriminatorConvention {
    element_name: String,
}

impl ScalarDiscriminatorConvention {
    pub fn new(element_name: impl Into<String>) -> Self {
        Self {
            element_name: element_name.into(),
        }
    }
}

impl Default for ScalarDiscriminatorConvention {
    fn default() -> Self {
        Self::new(DEFAULT_ELEMENT_NAME)
    }
}

impl DiscriminatorConvention for ScalarDiscriminatorConvention {
    fn element_name(&self) -> &str {
        &self.element_name
    }

    fn get_discriminator(
        &self,
        _nominal: TypeKey,
        actual: TypeKey,
        ctx: &SerializationContext,
    ) -> Result<Option<Bson>> {
        Ok(ctx
            .catalog()
            .get(actual)
            .and_then(|d| d.discriminator().cloned()))
    }
}

/// Writes the tag chain from the root class down to the actual type
///
/// A value written once this way can be read back at any ancestor nominal
/// type. Types outside a root-class hierarchy get a single tag.
pub struct HierarchicalDiscriminatorConvention {
    element_name: String,
}

impl HierarchicalDiscriminatorConvention {
    pub fn new(element_name: impl Into<String>) -> Self {
        Self {
            element_name: element_name.into(),
        }
    }
}

impl Default for HierarchicalDiscriminatorConvention {
    fn default() -> Self {
        Self::new(DEFAULT_ELEMENT_NAME)
    }
}

impl DiscriminatorConvention for HierarchicalDiscriminatorConvention {
    fn element_name(&self) -> &str {
        &self.element_name
    }

    fn get_discriminator(
        &self,
        _nominal: TypeKey,
        actual: TypeKey,
        ctx: &SerializationContext,
    ) -> Result<Option<Bson>> {
        let catalog = ctx.catalog();
        let chain = catalog.class_chain(actual);
        let root = chain
            .iter()
            .position(|k| catalog.get(*k).map(|d| d.is_root_class()).unwrap_or(false));
        let Some(root) = root else {
            return Ok(catalog.get(actual).and_then(|d| d.discriminator().cloned()));
        };
        let mut tags: Vec<Bson> = chain[..=root]
            .iter()
            .rev()
            .filter_map(|k| catalog.get(*k).and_then(|d| d.discriminator().cloned()))
            .collect();
        Ok(match tags.len() {
            0 => None,
            1 => tags.pop(),
            _ => Some(Bson::Array(tags)),
        })
    }
}
