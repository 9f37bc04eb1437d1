//! Version directory scheme.
//!
//! Every installed copy of the managed application lives in its own directory
//! named `<date>.<counter>`, e.g. `20161231.1`. Versions order by date first and
//! by counter second, so several releases on the same day stay in release order.
//! Names that do not have this shape are simply not versions.

use crate::error::{Result, UnattendedError};
use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default date format of version directories (`yyyyMMdd`)
pub const DEFAULT_VERSION_FORMAT: &str = "%Y%m%d";

/// A `(date, counter)` pair identifying one installed version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Release day
    pub date: NaiveDate,
    /// Disambiguates releases on the same day
    pub counter: u32,
}

impl Version {
    pub fn new(date: NaiveDate, counter: u32) -> Self {
        Self { date, counter }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.date.format("%Y-%m-%d"), self.counter)
    }
}

/// strftime pattern used for the date part of version directory names.
///
/// Only patterns that round-trip a calendar day can be constructed, so
/// formatting never fails once a `VersionFormat` exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionFormat {
    pattern: String,
}

impl Default for VersionFormat {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_VERSION_FORMAT.to_string(),
        }
    }
}

impl VersionFormat {
    /// Validate and wrap a strftime pattern
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() || StrftimeItems::new(pattern).any(|i| matches!(i, Item::Error)) {
            return Err(UnattendedError::InvalidVersionFormat(pattern.to_string()));
        }

        // The pattern has to identify a single day, otherwise parsing can't work
        let probe = NaiveDate::from_ymd_opt(2016, 12, 31)
            .ok_or_else(|| UnattendedError::InvalidVersionFormat(pattern.to_string()))?;
        let rendered = probe.format(pattern).to_string();
        match NaiveDate::parse_from_str(&rendered, pattern) {
            Ok(parsed) if parsed == probe => Ok(Self {
                pattern: pattern.to_string(),
            }),
            _ => Err(UnattendedError::InvalidVersionFormat(pattern.to_string())),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn format_date(&self, date: NaiveDate) -> String {
        date.format(&self.pattern).to_string()
    }

    /// Parse the date part exactly: re-formatting must give back the input
    pub fn parse_date(&self, text: &str) -> Option<NaiveDate> {
        let date = NaiveDate::parse_from_str(text, &self.pattern).ok()?;
        (self.format_date(date) == text).then_some(date)
    }

    /// Directory name for a version, e.g. `20161231.1`
    pub fn directory_name(&self, version: &Version) -> String {
        format!("{}.{}", self.format_date(version.date), version.counter)
    }

    /// Parse a directory name into a version. Anything that is not
    /// `<date>.<counter>` yields `None`.
    pub fn parse_directory(&self, name: &str) -> Option<Version> {
        let (date, counter) = name.rsplit_once('.')?;
        if counter.is_empty() || !counter.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let counter = counter.parse::<u32>().ok()?;
        let date = self.parse_date(date)?;
        Some(Version::new(date, counter))
    }

    /// Greatest version among the given directory names
    pub fn latest<'a, I>(&self, names: I) -> Option<Version>
    where
        I: IntoIterator<Item = &'a str>,
    {
        names
            .into_iter()
            .filter_map(|name| self.parse_directory(name))
            .max()
    }

    /// Whether two days fall on the same version date under this format
    pub fn same_day(&self, a: NaiveDate, b: NaiveDate) -> bool {
        self.format_date(a) == self.format_date(b)
    }

    /// Version to stage next, given the latest installed one and today's date.
    ///
    /// Same day bumps the counter, a new day starts again at 0. A latest
    /// version dated in the future (clock moved backwards) keeps counting on
    /// that date so ordering stays monotonic. `None` once the counter for
    /// that date is exhausted.
    pub fn next_version(&self, latest: &Version, today: NaiveDate) -> Option<Version> {
        if self.same_day(latest.date, today) || latest.date > today {
            let counter = latest.counter.checked_add(1)?;
            Some(Version::new(latest.date, counter))
        } else {
            Some(Version::new(today, 0))
        }
    }
}
