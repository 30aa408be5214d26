use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Utc};

/// A `year/month` slice of the log bucket.
///
/// ALB writes objects under `<base>/<YYYY>/<MM>/<DD>/...`, so one partition
/// is everything below the month directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    year: i32,
    month: u32,
}

impl Partition {
    pub fn new(year: i32, month: u32) -> Result<Self, InvalidPartition> {
        if !(1..=12).contains(&month) {
            return Err(InvalidPartition(format!("{}/{}", year, month)));
        }
        Ok(Partition { year, month })
    }

    /// The partition containing the current wall-clock time (UTC).
    pub fn current() -> Self {
        let now = Utc::now();
        Partition {
            year: now.year(),
            month: now.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// return the prefix of the objects to be fetched for this partition
    pub fn prefix(&self, base_prefix: &str) -> String {
        let base = base_prefix.trim_end_matches('/');
        if base.is_empty() {
            format!("{}/", self)
        } else {
            format!("{}/{}/", base, self)
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}/{:02}", self.year, self.month)
    }
}

impl FromStr for Partition {
    type Err = InvalidPartition;

    /// Accepts `YYYY/MM` or `YYYY-MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidPartition(s.to_string());
        let (year, month) = s.split_once(['/', '-']).ok_or_else(invalid)?;
        let year = year.parse().map_err(|_| invalid())?;
        let month = month.parse().map_err(|_| invalid())?;
        Partition::new(year, month).map_err(|_| invalid())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid partition '{0}', expected YYYY/MM")]
pub struct InvalidPartition(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_zero_pads_the_month() {
        let partition = Partition::new(2024, 5).unwrap();
        assert_eq!(
            partition.prefix("AWSLogs/123/elasticloadbalancing/us-east-1/"),
            "AWSLogs/123/elasticloadbalancing/us-east-1/2024/05/"
        );
        assert_eq!(partition.prefix("logs"), "logs/2024/05/");
        assert_eq!(partition.prefix(""), "2024/05/");
    }

    #[test]
    fn parses_both_separators() {
        assert_eq!("2024/05".parse::<Partition>().unwrap(), Partition::new(2024, 5).unwrap());
        assert_eq!("2023-12".parse::<Partition>().unwrap(), Partition::new(2023, 12).unwrap());
    }

    #[test]
    fn rejects_out_of_range_months() {
        assert!("2024/13".parse::<Partition>().is_err());
        assert!("2024/00".parse::<Partition>().is_err());
        assert!("202405".parse::<Partition>().is_err());
    }
}
