// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content keys: the totally-ordered identifier of one record.
//!
//! A key is a UTC timestamp (millisecond resolution) plus a short URL-safe
//! disambiguator. Keys render as a URL path fragment:
//!
//! ```text
//! 2014/12/03/17/24/58/123/a3f9c1
//! └──┘ └┘ └┘ └┘ └┘ └┘ └─┘ └────┘
//! year mo dd hh mm ss ms  hash
//! ```
//!
//! # Ordering
//!
//! Keys order by timestamp first, then by the disambiguator's lexicographic
//! value. The order only depends on the key's own fields, so every process
//! agrees on it without coordination. [`ContentKey::NONE`] (epoch, empty
//! disambiguator) precedes every real key.
//!
//! Times are limited to years 0000 through 9999 ([`ContentKey::MAX_MILLIS`]),
//! so the time prefix of the URL form is fixed width and the URL text sorts
//! in key order.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length of generated disambiguators.
const GENERATED_HASH_LEN: usize = 6;

/// Error returned when a string is not a valid content key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid content key '{input}': {reason}")]
pub struct ParseKeyError {
    pub input: String,
    pub reason: &'static str,
}

/// Identifier of one immutable record in a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey {
    // Field order matters: derived Ord compares millis, then hash.
    millis: i64,
    hash: String,
}

impl ContentKey {
    /// Sentinel that sorts before every real key.
    pub const NONE: ContentKey = ContentKey {
        millis: 0,
        hash: String::new(),
    };

    /// Last representable instant: 9999-12-31T23:59:59.999Z.
    pub const MAX_MILLIS: i64 = 253_402_300_799_999;

    /// Build a key from epoch millis and a disambiguator.
    ///
    /// Returns `None` if the time is before the epoch or after
    /// [`MAX_MILLIS`](Self::MAX_MILLIS), or the disambiguator is empty or
    /// not URL-safe.
    pub fn new(millis: i64, hash: impl Into<String>) -> Option<Self> {
        let hash = hash.into();
        if !(0..=Self::MAX_MILLIS).contains(&millis) || !is_valid_hash(&hash) {
            return None;
        }
        DateTime::<Utc>::from_timestamp_millis(millis)?;
        Some(Self { millis, hash })
    }

    /// Build a key at `time` with a freshly generated disambiguator.
    pub fn generate(time: DateTime<Utc>) -> Self {
        let hash = uuid::Uuid::new_v4().simple().to_string();
        Self {
            millis: time.timestamp_millis().clamp(0, Self::MAX_MILLIS),
            hash: hash[..GENERATED_HASH_LEN].to_string(),
        }
    }

    /// Key of a sequence channel item: the zero-padded sequence is the
    /// disambiguator, so items created in the same millisecond keep
    /// sequence order.
    pub fn for_sequence(time: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            millis: time.timestamp_millis().clamp(0, Self::MAX_MILLIS),
            hash: format!("{:020}", sequence),
        }
    }

    /// Epoch milliseconds of this key.
    pub fn millis(&self) -> i64 {
        self.millis
    }

    /// Disambiguator of this key.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Timestamp of this key.
    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Whether this is the [`NONE`](Self::NONE) sentinel.
    pub fn is_none(&self) -> bool {
        self.millis == 0 && self.hash.is_empty()
    }

    /// Render as a URL path fragment (`yyyy/MM/dd/HH/mm/ss/SSS/hash`).
    pub fn to_url(&self) -> String {
        format!("{}/{}", self.time().format("%Y/%m/%d/%H/%M/%S/%3f"), self.hash)
    }

    /// Parse a URL path fragment produced by [`to_url`](Self::to_url).
    pub fn from_url(url: &str) -> Option<Self> {
        url.parse().ok()
    }
}

impl Default for ContentKey {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

impl FromStr for ContentKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseKeyError {
            input: s.to_string(),
            reason,
        };

        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 8 {
            return Err(err("expected 8 path segments"));
        }

        let mut fields = [0u32; 7];
        for (slot, part) in fields.iter_mut().zip(&parts[..7]) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err("time segments must be numeric"));
            }
            *slot = part.parse().map_err(|_| err("time segment out of range"))?;
        }
        let [year, month, day, hour, minute, second, milli] = fields;
        // chrono reads 1000..=1999 as a leap second
        if milli > 999 {
            return Err(err("millisecond out of range"));
        }

        let date = NaiveDate::from_ymd_opt(year as i32, month, day)
            .ok_or_else(|| err("invalid date"))?;
        let time = date
            .and_hms_milli_opt(hour, minute, second, milli)
            .ok_or_else(|| err("invalid time of day"))?;
        let millis = time.and_utc().timestamp_millis();

        let hash = parts[7];
        if hash.is_empty() && millis == 0 {
            return Ok(Self::NONE);
        }
        Self::new(millis, hash).ok_or_else(|| err("invalid disambiguator"))
    }
}

impl Serialize for ContentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_url())
    }
}

impl<'de> Deserialize<'de> for ContentKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Disambiguators are non-empty and restricted to URL-unreserved characters.
pub fn is_valid_hash(hash: &str) -> bool {
    !hash.is_empty()
        && hash
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~'))
}

/// Extract the date components of a key (for diagnostics).
pub fn key_date(key: &ContentKey) -> (i32, u32, u32, u32) {
    let t = key.time();
    (t.year(), t.month(), t.day(), t.hour())
}
