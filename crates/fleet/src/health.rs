//! Check status model and the aggregation rule every component agrees on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregated health of a service instance or a host, as Consul reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Passing => "passing",
            CheckStatus::Warning => "warning",
            CheckStatus::Critical => "critical",
        }
    }

    /// Consul reports a handful of states; anything unknown is treated as
    /// critical so the healer errs toward recovery.
    pub fn parse(value: &str) -> CheckStatus {
        match value {
            "passing" => CheckStatus::Passing,
            "warning" => CheckStatus::Warning,
            _ => CheckStatus::Critical,
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fold a set of check statuses into one: any critical wins, then any
/// warning, otherwise passing.
pub fn combine_statuses<I>(statuses: I) -> CheckStatus
where
    I: IntoIterator<Item = CheckStatus>,
{
    let mut total = CheckStatus::Passing;
    for status in statuses {
        match status {
            CheckStatus::Critical => total = CheckStatus::Critical,
            CheckStatus::Warning if total == CheckStatus::Passing => {
                total = CheckStatus::Warning;
            }
            _ => {}
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_empty_is_passing() {
        assert_eq!(combine_statuses([]), CheckStatus::Passing);
    }

    #[test]
    fn test_combine_critical_wins() {
        let statuses = [
            CheckStatus::Passing,
            CheckStatus::Critical,
            CheckStatus::Warning,
        ];
        assert_eq!(combine_statuses(statuses), CheckStatus::Critical);
    }

    #[test]
    fn test_combine_warning_over_passing() {
        let statuses = [CheckStatus::Passing, CheckStatus::Warning];
        assert_eq!(combine_statuses(statuses), CheckStatus::Warning);
    }

    #[test]
    fn test_parse_unknown_is_critical() {
        assert_eq!(CheckStatus::parse("maintenance"), CheckStatus::Critical);
        assert_eq!(CheckStatus::parse("passing"), CheckStatus::Passing);
        assert_eq!(CheckStatus::parse("warning"), CheckStatus::Warning);
    }
}
