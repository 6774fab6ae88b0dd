//! Document id generators

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use once_cell::sync::Lazy;

use crate::datetime::DateTime;
use crate::error::{BsonError, Result};
use crate::oid::{machine_id, process_id, random_seed, ObjectId};
use crate::value::Bson;

use super::types::AnyObject;

/// Creates ids and recognizes unset ones
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> Result<AnyObject>;

    /// Whether `id` is the "not yet assigned" value
    fn is_empty(&self, id: &dyn Any) -> bool;
}

pub struct ObjectIdGenerator;

impl IdGenerator for ObjectIdGenerator {
    fn generate(&self) -> Result<AnyObject> {
        Ok(Box::new(ObjectId::new()))
    }

    fn is_empty(&self, id: &dyn Any) -> bool {
        id.downcast_ref::<ObjectId>().map_or(true, ObjectId::is_empty)
    }
}

/// Random (version 4) UUIDs
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> Result<AnyObject> {
        Ok(Box::new(uuid::Uuid::new_v4()))
    }

    fn is_empty(&self, id: &dyn Any) -> bool {
        id.downcast_ref::<uuid::Uuid>().map_or(true, uuid::Uuid::is_nil)
    }
}

static ASCENDING_COUNTER: Lazy<AtomicU32> = Lazy::new(|| AtomicU32::new(random_seed()));
static LAST_TICKS: AtomicU64 = AtomicU64::new(0);

/// 100-nanosecond intervals between 0001-01-01 and the Unix epoch
const EPOCH_TICKS: u64 = (-DateTime::MIN_MILLIS) as u64 * 10_000;

/// UUIDs whose leading bytes are a big-endian timestamp, so ids sort by creation
///
/// Layout: 8-byte tick count (100 ns since 0001-01-01), 3-byte machine id,
/// 2-byte process id, 3-byte counter.
pub struct AscendingUuidGenerator;

impl AscendingUuidGenerator {
    pub fn next_uuid() -> uuid::Uuid {
        let now = chrono::Utc::now();
        let since_epoch = now.timestamp_millis() as i128 * 10_000
            + (now.timestamp_subsec_nanos() % 1_000_000) as i128 / 100;
        let ticks = (EPOCH_TICKS as i128 + since_epoch).max(0) as u64;
        // never go backwards, even if the wall clock does
        let previous = LAST_TICKS.fetch_max(ticks, Ordering::SeqCst);
        let ticks = ticks.max(previous);
        let counter = ASCENDING_COUNTER.fetch_add(1, Ordering::SeqCst) & 0x00FF_FFFF;

        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&ticks.to_be_bytes());
        bytes[8..11].copy_from_slice(&machine_id());
        bytes[11..13].copy_from_slice(&process_id().to_be_bytes());
        bytes[13..16].copy_from_slice(&counter.to_be_bytes()[1..4]);
        uuid::Uuid::from_bytes(bytes)
    }

    /// Embedded tick count of an ascending UUID
    pub fn ticks(id: &uuid::Uuid) -> u64 {
        let b = id.as_bytes();
        u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    }
}

impl IdGenerator for AscendingUuidGenerator {
    fn generate(&self) -> Result<AnyObject> {
        Ok(Box::new(Self::next_uuid()))
    }

    fn is_empty(&self, id: &dyn Any) -> bool {
        id.downcast_ref::<uuid::Uuid>().map_or(true, uuid::Uuid::is_nil)
    }
}

/// Accepts any non-null `Bson` id; cannot generate
pub struct NullIdChecker;

impl IdGenerator for NullIdChecker {
    fn generate(&self) -> Result<AnyObject> {
        Err(BsonError::Id("a null id was found and no generator can replace it".into()))
    }

    fn is_empty(&self, id: &dyn Any) -> bool {
        id.downcast_ref::<Bson>().map_or(true, Bson::is_null)
    }
}

/// Treats `T::default()` as unset; cannot generate
pub struct ZeroIdChecker<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> ZeroIdChecker<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for ZeroIdChecker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Any + Default + PartialEq> IdGenerator for ZeroIdChecker<T> {
    fn generate(&self) -> Result<AnyObject> {
        Err(BsonError::Id(format!(
            "a zero {} id was found and no generator can replace it",
            std::any::type_name::<T>()
        )))
    }

    fn is_empty(&self, id: &dyn Any) -> bool {
        id.downcast_ref::<T>().map_or(true, |v| *v == T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascending_uuid_timestamps_non_decreasing() {
        let generator = AscendingUuidGenerator;
        let mut last = 0u64;
        for _ in 0..1_000 {
            let id = generator.generate().unwrap().downcast::<uuid::Uuid>().unwrap();
            let ticks = AscendingUuidGenerator::ticks(&id);
            assert!(ticks >= last);
            assert!(!generator.is_empty(&*id));
            last = ticks;
        }
    }

    #[test]
    fn test_ascending_uuid_layout() {
        let id = AscendingUuidGenerator::next_uuid();
        let b = id.as_bytes();
        assert_eq!(&b[8..11], &machine_id());
        assert_eq!(&b[11..13], &process_id().to_be_bytes());
        // ticks for a date after 2020-01-01
        assert!(AscendingUuidGenerator::ticks(&id) > 637_134_336_000_000_000);
    }

    #[test]
    fn test_object_id_generator() {
        let generator = ObjectIdGenerator;
        assert!(generator.is_empty(&ObjectId::default()));
        let id = generator.generate().unwrap();
        assert!(!generator.is_empty(&*id));
    }

    #[test]
    fn test_uuid_generator() {
        let generator = UuidGenerator;
        assert!(generator.is_empty(&uuid::Uuid::nil()));
        let id = generator.generate().unwrap().downcast::<uuid::Uuid>().unwrap();
        assert_eq!(id.get_version_num(), 4);
    }

    #[test]
    fn test_checkers() {
        assert!(NullIdChecker.is_empty(&Bson::Null));
        assert!(!NullIdChecker.is_empty(&Bson::Int32(0)));
        assert!(NullIdChecker.generate().is_err());

        let zero = ZeroIdChecker::<i64>::new();
        assert!(zero.is_empty(&0i64));
        assert!(!zero.is_empty(&5i64));
        assert!(zero.generate().is_err());
    }
}
