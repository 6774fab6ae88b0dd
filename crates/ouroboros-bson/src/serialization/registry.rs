//! Serializer registry
//!
//! Lookup order for a type that has no cached serializer yet:
//! the serializer declared on the type, then a generic template matching the
//! type's generic definition, then the provider chain (last registered first).
//! A resolved serializer is cached and never replaced.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use tracing::{debug, trace};

use crate::document::Document;
use crate::error::{BsonError, Result};
use crate::value::Bson;

use super::serializer::BsonSerializer;
use super::templates::GenericTemplate;
use super::types::{TypeCatalog, TypeKey};

/// Supplies serializers on demand
pub trait SerializationProvider: Send + Sync {
    /// Serializer for `key`, or `None` to let the next provider try
    ///
    /// Called while resolving a cache miss; implementations must not look
    /// serializers up through the context.
    fn get_serializer(&self, key: TypeKey, catalog: &TypeCatalog) -> Option<Arc<dyn BsonSerializer>>;
}

pub struct SerializerRegistry {
    cache: RwLock<HashMap<TypeKey, Arc<dyn BsonSerializer>>>,
    templates: HashMap<&'static str, Arc<dyn GenericTemplate>>,
    providers: Vec<Arc<dyn SerializationProvider>>,
}

impl SerializerRegistry {
    pub(crate) fn new(
        templates: Vec<Arc<dyn GenericTemplate>>,
        providers: Vec<Arc<dyn SerializationProvider>>,
    ) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            templates: templates.into_iter().map(|t| (t.definition(), t)).collect(),
            providers,
        }
    }

    /// Serializer for `key`; repeated lookups return the same instance
    pub fn lookup(&self, key: TypeKey, catalog: &TypeCatalog) -> Result<Arc<dyn BsonSerializer>> {
        if let Some(serializer) = self.cache.read().get(&key) {
            return Ok(serializer.clone());
        }

        let resolved = self.resolve(key, catalog)?;

        let guard = self.cache.upgradable_read();
        if let Some(existing) = guard.get(&key) {
            // another thread stored first; keep its instance
            return Ok(existing.clone());
        }
        let mut cache = RwLockUpgradableReadGuard::upgrade(guard);
        cache.insert(key, resolved.clone());
        debug!(type_name = %key, "serializer cached");
        Ok(resolved)
    }

    /// Register a serializer for exactly `key`
    pub fn register(
        &self,
        key: TypeKey,
        serializer: Arc<dyn BsonSerializer>,
        catalog: &TypeCatalog,
    ) -> Result<()> {
        if Self::is_protected(key, catalog) {
            return Err(BsonError::RegistrationRefused(key.short_name().to_string()));
        }
        let guard = self.cache.upgradable_read();
        if guard.contains_key(&key) {
            return Err(BsonError::DuplicateSerializer(key.short_name().to_string()));
        }
        let mut cache = RwLockUpgradableReadGuard::upgrade(guard);
        cache.insert(key, serializer);
        debug!(type_name = %key, "serializer registered");
        Ok(())
    }

    pub fn is_cached(&self, key: TypeKey) -> bool {
        self.cache.read().contains_key(&key)
    }

    fn is_protected(key: TypeKey, catalog: &TypeCatalog) -> bool {
        key == TypeKey::of::<Document>()
            || key == TypeKey::of::<Bson>()
            || catalog.get(key).map(|d| d.is_self_serializing()).unwrap_or(false)
    }

    fn resolve(&self, key: TypeKey, catalog: &TypeCatalog) -> Result<Arc<dyn BsonSerializer>> {
        if let Some(descriptor) = catalog.get(key) {
            if let Some(serializer) = &descriptor.serializer {
                trace!(type_name = %key, "using declared serializer");
                return Ok(serializer.clone());
            }
            if let Some(instance) = descriptor.generic() {
                if let Some(template) = self.templates.get(instance.definition) {
                    trace!(type_name = %key, definition = instance.definition, "instantiating template");
                    return template.instantiate(key, instance);
                }
            }
        }
        for provider in self.providers.iter().rev() {
            if let Some(serializer) = provider.get_serializer(key, catalog) {
                return Ok(serializer);
            }
        }
        Err(BsonError::NoSerializer(key.short_name().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::primitives::{DefaultSerializationProvider, Int32Serializer};
    use crate::serialization::serializer::typed;

    fn registry() -> SerializerRegistry {
        SerializerRegistry::new(
            Vec::new(),
            vec![Arc::new(DefaultSerializationProvider::new()) as Arc<dyn SerializationProvider>],
        )
    }

    #[test]
    fn test_lookup_is_reference_stable() {
        let r = registry();
        let catalog = TypeCatalog::default();
        let a = r.lookup(TypeKey::of::<i32>(), &catalog).unwrap();
        let b = r.lookup(TypeKey::of::<i32>(), &catalog).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_missing_serializer() {
        struct Unknown;
        let r = registry();
        let err = r
            .lookup(TypeKey::of::<Unknown>(), &TypeCatalog::default())
            .err()
            .unwrap();
        assert!(matches!(err, BsonError::NoSerializer(name) if name == "Unknown"));
    }

    #[test]
    fn test_register_twice_fails() {
        let r = registry();
        let catalog = TypeCatalog::default();
        r.register(TypeKey::of::<i32>(), typed::<i32, _>(Int32Serializer), &catalog)
            .unwrap();
        let err = r
            .register(TypeKey::of::<i32>(), typed::<i32, _>(Int32Serializer), &catalog)
            .unwrap_err();
        assert!(matches!(err, BsonError::DuplicateSerializer(_)));
    }

    #[test]
    fn test_register_after_lookup_fails() {
        let r = registry();
        let catalog = TypeCatalog::default();
        r.lookup(TypeKey::of::<i32>(), &catalog).unwrap();
        assert!(r
            .register(TypeKey::of::<i32>(), typed::<i32, _>(Int32Serializer), &catalog)
            .is_err());
    }

    #[test]
    fn test_document_serializer_is_protected() {
        let r = registry();
        let catalog = TypeCatalog::default();
        let err = r
            .register(TypeKey::of::<Document>(), typed::<i32, _>(Int32Serializer), &catalog)
            .unwrap_err();
        assert!(matches!(err, BsonError::RegistrationRefused(_)));
    }

    #[test]
    fn test_concurrent_lookups_agree() {
        let r = Arc::new(registry());
        let catalog = Arc::new(TypeCatalog::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = r.clone();
                let catalog = catalog.clone();
                std::thread::spawn(move || r.lookup(TypeKey::of::<String>(), &catalog).unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for s in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], s));
        }
    }
}
