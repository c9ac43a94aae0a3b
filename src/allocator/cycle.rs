use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A UTC calendar month, `[start, end)`, tagged `YYYY-MM`.
///
/// Billing cycles and quota periods share this boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillingCycle {
    pub tag: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

impl BillingCycle {
    pub fn containing(now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        Self::starting(today - Days::new(u64::from(today.day0())))
    }

    /// Parses a `YYYY-MM` tag.
    pub fn parse(tag: &str) -> Result<Self> {
        let first = NaiveDate::parse_from_str(&format!("{}-01", tag), "%Y-%m-%d")
            .map_err(|e| Error::invalid(format!("invalid billing cycle '{}': {}", tag, e)))?;
        let cycle = Self::starting(first);
        if cycle.tag != tag {
            return Err(Error::invalid(format!(
                "billing cycle must be formatted YYYY-MM, got '{}'",
                tag
            )));
        }
        Ok(cycle)
    }

    fn starting(first: NaiveDate) -> Self {
        Self {
            tag: first.format("%Y-%m").to_string(),
            start: midnight(first),
            end: midnight(first + Months::new(1)),
        }
    }

    pub fn next(&self) -> Self {
        Self::starting(self.first_day() + Months::new(1))
    }

    pub fn first_day(&self) -> NaiveDate {
        self.start.date_naive()
    }

    pub fn last_day(&self) -> NaiveDate {
        self.end.date_naive() - Days::new(1)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Expiry for this cycle's INCLUDED grant: the end of the cycle plus
    /// `rollover_cycles` further cycles.
    pub fn expiry_after(&self, rollover_cycles: u32) -> DateTime<Utc> {
        midnight(self.first_day() + Months::new(1 + rollover_cycles))
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.tag)
    }
}
