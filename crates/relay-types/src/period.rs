//! Month-boundary arithmetic for `YYYY-MM` accounting periods.
//!
//! Every consumer of period math (month-end closing, forecasts, digests)
//! goes through this module rather than re-deriving first/last day inline.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    /// Parse a `YYYY-MM` string. Rejects out-of-range months.
    pub fn parse(s: &str) -> Option<Self> {
        let (y, m) = s.split_once('-')?;
        if y.len() != 4 || m.len() != 2 {
            return None;
        }
        let year: i32 = y.parse().ok()?;
        let month: u32 = m.parse().ok()?;
        if !(1..=12).contains(&month) {
            return None;
        }
        Some(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(self) -> NaiveDate {
        // month is validated at construction
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// Last calendar day of the month, leap-year aware.
    pub fn last_day(self) -> NaiveDate {
        self.next().first_day().pred_opt().unwrap_or(NaiveDate::MIN)
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn prev(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn days_in_month(self) -> u32 {
        self.last_day().day()
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl TryFrom<String> for Period {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Period::parse(&value).ok_or_else(|| format!("invalid period `{value}` (expected YYYY-MM)"))
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_period() {
        let p = Period::parse("2026-02").unwrap();
        assert_eq!(p.year, 2026);
        assert_eq!(p.month, 2);
        assert_eq!(p.to_string(), "2026-02");
    }

    #[test]
    fn rejects_invalid_periods() {
        assert!(Period::parse("2026-13").is_none());
        assert!(Period::parse("2026-00").is_none());
        assert!(Period::parse("26-01").is_none());
        assert!(Period::parse("2026/01").is_none());
        assert!(Period::parse("garbage").is_none());
    }

    #[test]
    fn last_day_handles_leap_years() {
        assert_eq!(
            Period::parse("2024-02").unwrap().last_day(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert_eq!(
            Period::parse("2025-02").unwrap().last_day(),
            NaiveDate::from_ymd_opt(2025, 2, 28).unwrap()
        );
        assert_eq!(
            Period::parse("2100-02").unwrap().last_day(),
            NaiveDate::from_ymd_opt(2100, 2, 28).unwrap()
        );
    }

    #[test]
    fn december_rolls_into_next_year() {
        let p = Period::parse("2025-12").unwrap();
        assert_eq!(p.next().to_string(), "2026-01");
        assert_eq!(
            p.last_day(),
            NaiveDate::from_ymd_opt(2025, 12, 31).unwrap()
        );
    }
}
