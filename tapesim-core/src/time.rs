//! Epoch/wall-time conversion in a named timezone.
//!
//! Replay tables store timestamps as raw integers in one of a handful of
//! epoch units. A [`TimeRep`] pairs such a unit with an IANA timezone and
//! converts between raw epochs and absolute [`DateTime<Utc>`] instants.
//! The `Days` unit is calendar-based: it counts local dates since
//! 1970-01-01 in the configured timezone, which is also what drives
//! end-of-day rollover detection.

use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Granularity of raw integer timestamps stored in a replay table.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EpochUnit {
    Seconds,
    #[default]
    Millis,
    Micros,
    Days,
}

impl FromStr for EpochUnit {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "s" | "sec" | "secs" | "seconds" => Ok(Self::Seconds),
            "ms" | "millis" | "milliseconds" => Ok(Self::Millis),
            "us" | "micros" | "microseconds" => Ok(Self::Micros),
            "d" | "day" | "days" => Ok(Self::Days),
            other => Err(format!("unsupported epoch unit '{other}'")),
        }
    }
}

/// Epoch unit plus timezone, negotiated once per connection from the
/// server's default table.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TimeRep {
    pub unit: EpochUnit,
    pub tz: Tz,
}

impl Default for TimeRep {
    fn default() -> Self {
        Self {
            unit: EpochUnit::Millis,
            tz: Tz::UTC,
        }
    }
}

fn epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("unix epoch date")
}

impl TimeRep {
    /// Build a representation from config strings (`"ms"`, `"Asia/Tokyo"`).
    pub fn parse(unit: &str, tz: &str) -> Result<Self, String> {
        let unit = unit.parse()?;
        let tz: Tz = tz.parse().map_err(|_| format!("unknown timezone '{tz}'"))?;
        Ok(Self { unit, tz })
    }

    /// Convert an absolute instant into this representation's raw epoch.
    #[must_use]
    pub fn to_epoch(&self, ts: DateTime<Utc>) -> i64 {
        match self.unit {
            EpochUnit::Seconds => ts.timestamp(),
            EpochUnit::Millis => ts.timestamp_millis(),
            EpochUnit::Micros => ts.timestamp_micros(),
            EpochUnit::Days => self.day_index(ts),
        }
    }

    /// Convert a raw epoch back into an absolute instant. `Days` maps to
    /// local midnight of that date in the configured timezone. Returns
    /// `None` when the raw value is out of the representable range.
    #[must_use]
    pub fn from_epoch(&self, raw: i64) -> Option<DateTime<Utc>> {
        match self.unit {
            EpochUnit::Seconds => DateTime::from_timestamp(raw, 0),
            EpochUnit::Millis => DateTime::from_timestamp_millis(raw),
            EpochUnit::Micros => DateTime::from_timestamp_micros(raw),
            EpochUnit::Days => {
                let date = epoch_date().checked_add_signed(Duration::days(raw))?;
                let midnight = date.and_hms_opt(0, 0, 0)?;
                self.tz
                    .from_local_datetime(&midnight)
                    .earliest()
                    .map(|local| local.with_timezone(&Utc))
            }
        }
    }

    /// Days since 1970-01-01 of the local date in this timezone. Two
    /// instants share a day index iff they fall on the same local date.
    #[must_use]
    pub fn day_index(&self, ts: DateTime<Utc>) -> i64 {
        ts.with_timezone(&self.tz)
            .date_naive()
            .signed_duration_since(epoch_date())
            .num_days()
    }
}
