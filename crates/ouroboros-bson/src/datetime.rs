//! UTC date-time stored as milliseconds since the Unix epoch

use std::fmt;

use chrono::{TimeZone, Utc};

/// Milliseconds since the epoch, as encoded on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DateTime(i64);

impl DateTime {
    /// 9999-12-31T23:59:59.999Z
    pub const MAX_MILLIS: i64 = 253_402_300_799_999;
    /// 0001-01-01T00:00:00Z
    pub const MIN_MILLIS: i64 = -62_135_596_800_000;

    pub const MAX: DateTime = DateTime(Self::MAX_MILLIS);
    pub const MIN: DateTime = DateTime(Self::MIN_MILLIS);

    /// Raw wire value; no clamping is applied
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub const fn timestamp_millis(&self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        Self::from_chrono(Utc::now())
    }

    /// Convert from chrono, clamping to the representable range
    ///
    /// Every instant at or past the last representable millisecond maps to
    /// `MAX_MILLIS`, including sub-millisecond instants inside that final
    /// millisecond.
    pub fn from_chrono(dt: chrono::DateTime<Utc>) -> Self {
        let millis = dt.timestamp_millis();
        Self(millis.clamp(Self::MIN_MILLIS, Self::MAX_MILLIS))
    }

    /// Convert to chrono
    ///
    /// Values at or past the upper boundary always decode to the canonical
    /// maximum `9999-12-31T23:59:59.999999999Z`, whichever input produced them.
    pub fn to_chrono(&self) -> chrono::DateTime<Utc> {
        if self.0 >= Self::MAX_MILLIS {
            return canonical_max();
        }
        let millis = self.0.max(Self::MIN_MILLIS);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(canonical_max)
    }

    pub fn is_max(&self) -> bool {
        self.0 >= Self::MAX_MILLIS
    }
}

fn canonical_max() -> chrono::DateTime<Utc> {
    chrono::DateTime::<Utc>::from_timestamp(MAX_SECONDS, 999_999_999)
        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
}

const MAX_SECONDS: i64 = DateTime::MAX_MILLIS / 1000;

impl From<chrono::DateTime<Utc>> for DateTime {
    fn from(dt: chrono::DateTime<Utc>) -> Self {
        Self::from_chrono(dt)
    }
}

impl From<DateTime> for chrono::DateTime<Utc> {
    fn from(dt: DateTime) -> Self {
        dt.to_chrono()
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.to_chrono()
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        )
    }
}
