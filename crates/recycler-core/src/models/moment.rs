//! Nanosecond-precision instants and millisecond durations.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::errors::{RecyclerError, RecyclerResult};
use crate::models::wire::{format_radix, parse_decimal, parse_radix};

const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// A point in time, held as nanoseconds since the epoch.
///
/// The wire form is `<seconds>.<nanoseconds>` with both parts in radix 36.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Moment {
    nanos: i64,
}

impl Moment {
    pub fn now() -> Self {
        Self::from_millis(Utc::now().timestamp_millis())
    }

    pub fn from_millis(millis: i64) -> Self {
        Self {
            nanos: millis.saturating_mul(NANOS_PER_MILLI),
        }
    }

    pub fn from_parts(seconds: i64, nanos: i64) -> Self {
        Self {
            nanos: seconds.saturating_mul(NANOS_PER_SECOND).saturating_add(nanos),
        }
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Self { nanos }
    }

    pub fn parse(text: &str) -> RecyclerResult<Self> {
        let (secs, nanos) = text
            .split_once('.')
            .ok_or_else(|| RecyclerError::malformed("moment without '.'", text))?;
        let out_of_range = || RecyclerError::malformed("moment out of range", text);
        let secs = i64::try_from(parse_radix(secs)?).map_err(|_| out_of_range())?;
        let nanos = i64::try_from(parse_radix(nanos)?).map_err(|_| out_of_range())?;
        if nanos >= NANOS_PER_SECOND {
            return Err(out_of_range());
        }
        let total = secs
            .checked_mul(NANOS_PER_SECOND)
            .and_then(|n| n.checked_add(nanos))
            .ok_or_else(out_of_range)?;
        Ok(Self::from_nanos(total))
    }

    pub fn as_nanos(&self) -> i64 {
        self.nanos
    }

    pub fn millis(&self) -> i64 {
        self.nanos / NANOS_PER_MILLI
    }

    pub fn seconds(&self) -> i64 {
        self.nanos / NANOS_PER_SECOND
    }

    pub fn subsec_nanos(&self) -> i64 {
        self.nanos % NANOS_PER_SECOND
    }

    pub fn to_standard_string(&self) -> String {
        format!(
            "{}.{}",
            format_radix(self.seconds().max(0) as u64),
            format_radix(self.subsec_nanos().max(0) as u64)
        )
    }

    /// `yyyy-MM-ddTHH:mm:ss+0000`, in UTC.
    pub fn to_iso_string(&self) -> String {
        match DateTime::<Utc>::from_timestamp_millis(self.millis()) {
            Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%z").to_string(),
            None => self.to_standard_string(),
        }
    }
}

impl fmt::Display for Moment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_standard_string())
    }
}

/// Elapsed wall time in milliseconds. Travels as a plain decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Elapsed {
    millis: i64,
}

impl Elapsed {
    pub fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    pub fn parse(text: &str) -> RecyclerResult<Self> {
        Ok(Self::from_millis(parse_decimal(text)?))
    }

    pub fn between(start: Moment, end: Moment) -> Self {
        Self::from_millis(end.millis() - start.millis())
    }

    pub fn since(start: Moment) -> Self {
        Self::between(start, Moment::now())
    }

    pub fn millis(&self) -> i64 {
        self.millis
    }

    pub fn to_simple_string(&self) -> String {
        self.millis.to_string()
    }

    /// `HH:MM:SS`, rounded to the nearest second. Hours wrap at a day.
    pub fn to_standard_string(&self) -> String {
        let total = (self.millis + 500).div_euclid(1000);
        let secs = total.rem_euclid(60);
        let mins = total.div_euclid(60).rem_euclid(60);
        let hours = total.div_euclid(3600).rem_euclid(24);
        format!("{hours:02}:{mins:02}:{secs:02}")
    }
}

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_standard_string())
    }
}
