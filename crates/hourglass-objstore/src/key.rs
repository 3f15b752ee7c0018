//! Deterministic object keys for logical slots.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// How finely a slot instant is rendered into an object key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPrecision {
    Seconds,
    Millis,
    Micros,
    Nanos,
}

impl KeyPrecision {
    /// Pick the coarsest precision that evenly divides `interval`.
    ///
    /// Two slots of the same schedule differ by a whole multiple of the
    /// interval, so truncating both to a unit that divides the interval
    /// can never make them equal.
    pub fn for_interval(interval: TimeDelta) -> Self {
        let nanos = (interval.num_seconds() as i128) * NANOS_PER_SEC
            + interval.subsec_nanos() as i128;

        if nanos % NANOS_PER_SEC == 0 {
            Self::Seconds
        } else if nanos % 1_000_000 == 0 {
            Self::Millis
        } else if nanos % 1_000 == 0 {
            Self::Micros
        } else {
            Self::Nanos
        }
    }

    fn fraction_format(self) -> &'static str {
        match self {
            Self::Seconds => "",
            Self::Millis => "%.3f",
            Self::Micros => "%.6f",
            Self::Nanos => "%.9f",
        }
    }
}

/// Key of an artifact inside its container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Wrap an already-derived key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive the key for a slot: `{prefix}YYYYMMDDTHHMMSS[.fff]Z{suffix}`.
    ///
    /// The timestamp part has a fixed width for a given precision, so keys of
    /// one schedule sort in slot order.
    pub fn for_slot(
        prefix: &str,
        slot: DateTime<Utc>,
        precision: KeyPrecision,
        suffix: &str,
    ) -> Self {
        let pattern = format!("%Y%m%dT%H%M%S{}Z", precision.fraction_format());
        Self(format!("{}{}{}", prefix, slot.format(&pattern), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
