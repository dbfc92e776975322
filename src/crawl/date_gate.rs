//! Chronological cutoff for discovery.

use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

/// Date formats the feed has been seen to use. Date-only formats are tried first.
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%Y年%m月%d日"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M", "%Y/%m/%d %H:%M"];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unrecognized release date: {0:?}")]
pub struct DateParseError(pub String);

/// Parse a feed release date in any of the known formats.
pub fn parse_release_date(s: &str) -> Result<NaiveDateTime, DateParseError> {
    let t = s.trim();
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(t, fmt) {
            if let Some(dt) = d.and_hms_opt(0, 0, 0) {
                return Ok(dt);
            }
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(t, fmt) {
            return Ok(dt);
        }
    }
    Err(DateParseError(s.to_string()))
}

/// Decides whether an item is older than the cutoff and discovery must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateGate {
    cutoff: NaiveDate,
}

impl DateGate {
    pub fn new(cutoff: NaiveDate) -> Self {
        Self { cutoff }
    }

    pub fn cutoff(&self) -> NaiveDate {
        self.cutoff
    }

    /// True only for a parsable date strictly before the cutoff. Unparsable dates are fail-open.
    pub fn is_before_cutoff(&self, release_date: &str) -> bool {
        match parse_release_date(release_date) {
            Ok(dt) => dt.date() < self.cutoff,
            Err(e) => {
                tracing::debug!(error = %e, "Release date not parsed; not gating");
                false
            }
        }
    }
}

impl Default for DateGate {
    fn default() -> Self {
        Self::new(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> DateGate {
        DateGate::default()
    }

    #[test]
    fn parses_every_known_format() {
        for s in [
            "2021-03-04",
            "2021/03/04",
            "2021年03月04日",
            "2021-03-04 08:30",
            "2021/03/04 08:30",
            " 2021-03-04 ",
        ] {
            let dt = parse_release_date(s).unwrap_or_else(|e| panic!("{}: {}", s, e));
            assert_eq!(dt.date(), NaiveDate::from_ymd_opt(2021, 3, 4).unwrap());
        }
    }

    #[test]
    fn before_cutoff_is_strict() {
        assert!(gate().is_before_cutoff("2019-12-31"));
        assert!(gate().is_before_cutoff("2019年12月31日"));
        assert!(!gate().is_before_cutoff("2020-01-01"));
        assert!(!gate().is_before_cutoff("2020/01/01 00:01"));
    }

    #[test]
    fn unparsable_dates_fail_open() {
        for s in ["", "昨天", "星期三", "10月18日", "2019-13-45", "not a date"] {
            assert!(parse_release_date(s).is_err());
            assert!(!gate().is_before_cutoff(s), "{:?} must not gate", s);
        }
    }

    #[test]
    fn custom_cutoff() {
        let g = DateGate::new(NaiveDate::from_ymd_opt(2023, 6, 1).unwrap());
        assert!(g.is_before_cutoff("2023-05-31"));
        assert!(!g.is_before_cutoff("2023-06-01"));
    }
}
