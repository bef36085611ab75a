//! Per-key quota exceptions.
//!
//! Exceptions are loaded from YAML and matched against the limiter key:
//!
//! ```yaml
//! exceptions:
//!   - key: "10.0.0.1"
//!     points: 1000
//!     unit: minute
//!   - prefix: "partner:"
//!     points: 50
//!     unit: second
//!     units: 10
//! ```
//!
//! An exact key match beats any prefix, and the longest matching prefix wins.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::store::{ExclFn, Quota};
use crate::error::{RatekeeperError, Result};

/// Time unit for exception windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

fn default_units() -> u32 {
    1
}

/// One exception entry. Exactly one of `key` and `prefix` must be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRule {
    /// Match this key exactly
    #[serde(default)]
    pub key: Option<String>,
    /// Match every key starting with this prefix
    #[serde(default)]
    pub prefix: Option<String>,
    /// Points per window
    pub points: u64,
    /// The window's time unit
    pub unit: TimeUnit,
    /// How many units make up a window
    #[serde(default = "default_units")]
    pub units: u32,
    /// Optional name/description for this exception
    #[serde(default)]
    pub name: Option<String>,
}

impl ExceptionRule {
    /// The quota this rule grants.
    pub fn quota(&self) -> Quota {
        Quota::new(self.points, self.unit.duration() * self.units)
    }
}

/// A set of exception rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRules {
    #[serde(default)]
    pub exceptions: Vec<ExceptionRule>,
}

impl ExceptionRules {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit exceptions");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: ExceptionRules = serde_yaml::from_str(yaml).map_err(|e| {
            RatekeeperError::Config(format!("Failed to parse exception rules: {}", e))
        })?;
        rules.validate()?;
        Ok(rules)
    }

    fn validate(&self) -> Result<()> {
        for (index, rule) in self.exceptions.iter().enumerate() {
            if rule.key.is_some() == rule.prefix.is_some() {
                return Err(RatekeeperError::Config(format!(
                    "exception #{} must set exactly one of key or prefix",
                    index
                )));
            }
            if rule.units == 0 {
                return Err(RatekeeperError::Config(format!(
                    "exception #{} has a zero-length window",
                    index
                )));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.exceptions.is_empty()
    }

    /// Find the rule that applies to `key`.
    pub fn find(&self, key: &str) -> Option<&ExceptionRule> {
        if let Some(exact) = self
            .exceptions
            .iter()
            .find(|rule| rule.key.as_deref() == Some(key))
        {
            return Some(exact);
        }

        self.exceptions
            .iter()
            .filter(|rule| {
                rule.prefix
                    .as_deref()
                    .map_or(false, |prefix| key.starts_with(prefix))
            })
            .max_by_key(|rule| rule.prefix.as_deref().map_or(0, str::len))
    }

    /// The quota override for `key`, if any.
    pub fn quota_for(&self, key: &str) -> Option<Quota> {
        self.find(key).map(ExceptionRule::quota)
    }

    /// Turn the rules into an exception function for
    /// [`Store::take_excl`](super::Store::take_excl).
    pub fn into_excl_fn(self) -> Arc<ExclFn> {
        Arc::new(move |key: &str| self.quota_for(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rules() {
        let yaml = r#"
exceptions:
  - key: "10.0.0.1"
    points: 1000
    unit: minute
  - prefix: "partner:"
    points: 50
    unit: second
    units: 10
    name: partners
"#;
        let rules = ExceptionRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.exceptions.len(), 2);
        assert_eq!(rules.exceptions[0].units, 1);
        assert_eq!(rules.exceptions[1].name.as_deref(), Some("partners"));
        assert_eq!(
            rules.exceptions[1].quota(),
            Quota::new(50, Duration::from_secs(10))
        );
    }

    #[test]
    fn test_exact_key_beats_prefix() {
        let yaml = r#"
exceptions:
  - prefix: "user:"
    points: 10
    unit: second
  - key: "user:42"
    points: 99
    unit: hour
"#;
        let rules = ExceptionRules::from_yaml(yaml).unwrap();

        assert_eq!(
            rules.quota_for("user:42"),
            Some(Quota::new(99, Duration::from_secs(3600)))
        );
        assert_eq!(
            rules.quota_for("user:7"),
            Some(Quota::new(10, Duration::from_secs(1)))
        );
        assert_eq!(rules.quota_for("guest"), None);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let yaml = r#"
exceptions:
  - prefix: "a"
    points: 1
    unit: second
  - prefix: "abc"
    points: 3
    unit: second
  - prefix: "ab"
    points: 2
    unit: second
"#;
        let rules = ExceptionRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.find("abcd").unwrap().points, 3);
        assert_eq!(rules.find("abx").unwrap().points, 2);
        assert_eq!(rules.find("ax").unwrap().points, 1);
    }

    #[test]
    fn test_invalid_rules() {
        let both = r#"
exceptions:
  - key: "k"
    prefix: "p"
    points: 1
    unit: second
"#;
        assert!(matches!(
            ExceptionRules::from_yaml(both),
            Err(RatekeeperError::Config(_))
        ));

        let neither = r#"
exceptions:
  - points: 1
    unit: day
"#;
        assert!(ExceptionRules::from_yaml(neither).is_err());

        let zero = r#"
exceptions:
  - key: "k"
    points: 1
    unit: day
    units: 0
"#;
        assert!(ExceptionRules::from_yaml(zero).is_err());

        assert!(ExceptionRules::from_yaml("exceptions: [{ key: k, unit: fortnight }]").is_err());
    }

    #[test]
    fn test_excl_fn() {
        let rules = ExceptionRules {
            exceptions: vec![ExceptionRule {
                key: Some("vip".to_string()),
                prefix: None,
                points: 7,
                unit: TimeUnit::Minute,
                units: 2,
                name: None,
            }],
        };
        let excl = rules.into_excl_fn();

        assert_eq!(excl("vip"), Some(Quota::new(7, Duration::from_secs(120))));
        assert_eq!(excl("other"), None);
    }

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }
}
