//! Acquisition epoch pairs recovered from interferogram file names.
//!
//! Interferogram products are conventionally named after the two acquisition
//! dates that formed them, as `yymmdd-yymmdd` or `yyyymmdd-yyyymmdd` somewhere
//! in the file name. The pair drives the regression: each layer contributes
//! one observation at its time span.

use crate::core::error::ConfigError;
use chrono::NaiveDate;
use std::fmt;
use std::path::Path;

/// Days per year used for time spans, Julian-year style.
pub const DAYS_PER_YEAR: f64 = 365.25;

/// Two-digit years at or above this are read as 19xx, below as 20xx.
const CENTURY_PIVOT: u32 = 50;

/// The two acquisition dates behind one interferogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpochPair {
    /// First (reference) acquisition.
    pub primary: NaiveDate,
    /// Second acquisition.
    pub secondary: NaiveDate,
}

impl EpochPair {
    /// Pair two acquisition dates.
    pub fn new(primary: NaiveDate, secondary: NaiveDate) -> Self {
        Self { primary, secondary }
    }

    /// Recover the epoch pair from a product file name.
    ///
    /// Scans the file stem for two runs of exactly six or eight digits
    /// joined by a dash. Six-digit dates pivot on year 50: `500101` is
    /// 1950, `491231` is 2049.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ConfigError::MissingEpochPair {
                path: path.to_path_buf(),
            })?;

        let candidate =
            find_date_pair(stem).ok_or_else(|| ConfigError::MissingEpochPair {
                path: path.to_path_buf(),
            })?;

        let primary = parse_compact_date(candidate.0);
        let secondary = parse_compact_date(candidate.1);
        match (primary, secondary) {
            (Some(primary), Some(secondary)) => Ok(Self { primary, secondary }),
            _ => Err(ConfigError::InvalidEpochPair {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Time span between the acquisitions in years.
    pub fn span_years(&self) -> f64 {
        let days = self.secondary.signed_duration_since(self.primary).num_days();
        days as f64 / DAYS_PER_YEAR
    }
}

impl fmt::Display for EpochPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.primary.format("%Y%m%d"),
            self.secondary.format("%Y%m%d")
        )
    }
}

/// Find the first `<digits>-<digits>` pair in `stem` where both runs are
/// exactly six or exactly eight digits long.
fn find_date_pair(stem: &str) -> Option<(&str, &str)> {
    let bytes = stem.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'-' {
            continue;
        }
        for len in [8usize, 6] {
            if i < len || i + len >= bytes.len() {
                continue;
            }
            let before = &bytes[i - len..i];
            let after = &bytes[i + 1..i + 1 + len];
            if !before.iter().all(u8::is_ascii_digit)
                || !after.iter().all(u8::is_ascii_digit)
            {
                continue;
            }
            // The runs must be exact: a ninth digit on either side means
            // this dash joins something that is not a date pair.
            if i >= len + 1 && bytes[i - len - 1].is_ascii_digit() {
                continue;
            }
            if i + 1 + len < bytes.len() && bytes[i + 1 + len].is_ascii_digit() {
                continue;
            }
            return Some((&stem[i - len..i], &stem[i + 1..i + 1 + len]));
        }
    }
    None
}

/// Parse a `yymmdd` or `yyyymmdd` digit run into a calendar date.
fn parse_compact_date(digits: &str) -> Option<NaiveDate> {
    let (year, rest) = match digits.len() {
        6 => {
            let yy: u32 = digits[0..2].parse().ok()?;
            let year = if yy >= CENTURY_PIVOT { 1900 + yy } else { 2000 + yy };
            (year as i32, &digits[2..])
        }
        8 => {
            let yyyy: i32 = digits[0..4].parse().ok()?;
            (yyyy, &digits[4..])
        }
        _ => return None,
    };
    let month: u32 = rest[0..2].parse().ok()?;
    let day: u32 = rest[2..4].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_six_digit_names() {
        let pair = EpochPair::from_path(Path::new("geo_060619-061002_unw.tif")).unwrap();
        assert_eq!(pair.primary, date(2006, 6, 19));
        assert_eq!(pair.secondary, date(2006, 10, 2));
    }

    #[test]
    fn test_eight_digit_names() {
        let pair = EpochPair::from_path(Path::new("20060619-20061002.tif")).unwrap();
        assert_eq!(pair.primary, date(2006, 6, 19));
        assert_eq!(pair.secondary, date(2006, 10, 2));
    }

    #[test]
    fn test_century_pivot() {
        let pair = EpochPair::from_path(Path::new("900610-491231.tif")).unwrap();
        assert_eq!(pair.primary, date(1990, 6, 10));
        assert_eq!(pair.secondary, date(2049, 12, 31));

        let pair = EpochPair::from_path(Path::new("500101-500102.tif")).unwrap();
        assert_eq!(pair.primary.format("%Y").to_string(), "1950");
    }

    #[test]
    fn test_span_years() {
        let pair = EpochPair::new(date(2006, 6, 19), date(2006, 10, 2));
        let expected = 105.0 / DAYS_PER_YEAR;
        assert!((pair.span_years() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_missing_pair_is_an_error() {
        let err = EpochPair::from_path(Path::new("coherence_stack.tif")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEpochPair { .. }));

        // Seven-digit runs do not qualify.
        let err = EpochPair::from_path(Path::new("a1234567-1234567b.tif")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEpochPair { .. }));
    }

    #[test]
    fn test_invalid_calendar_date_is_an_error() {
        let err = EpochPair::from_path(Path::new("geo_061345-061002.tif")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEpochPair { .. }));
    }

    #[test]
    fn test_pair_inside_longer_name() {
        let path = PathBuf::from("/data/site7/geo_20060619-20061002_unw_4rlks.tif");
        let pair = EpochPair::from_path(&path).unwrap();
        assert_eq!(pair.to_string(), "20060619-20061002");
    }
}
