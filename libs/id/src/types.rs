//! Typed name definitions for autoscaling resources.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{define_name, IdError};

// =============================================================================
// Autoscaling
// =============================================================================

define_name!(AsgName, 255);
define_name!(LaunchConfigName, 255);

/// Suffix toggled on and off when a launch configuration is replaced.
const SUCCESSOR_SUFFIX: &str = "-0";

impl LaunchConfigName {
    /// Name for the configuration that replaces this one.
    ///
    /// Alternates between `name` and `name-0`, so repeated transitions reuse
    /// two names instead of growing the suffix.
    #[must_use]
    pub fn successor(&self) -> LaunchConfigName {
        match self.0.strip_suffix(SUCCESSOR_SUFFIX) {
            Some(base) if !base.is_empty() => LaunchConfigName(base.to_string()),
            _ if self.0.len() + SUCCESSOR_SUFFIX.len() <= Self::MAX_LEN => {
                LaunchConfigName(format!("{}{}", self.0, SUCCESSOR_SUFFIX))
            }
            // Too long to extend: trim the tail to make room.
            _ => {
                let keep: String = self
                    .0
                    .chars()
                    .take(Self::MAX_LEN - SUCCESSOR_SUFFIX.len())
                    .collect();
                LaunchConfigName(format!("{keep}{SUCCESSOR_SUFFIX}"))
            }
        }
    }
}

pub(crate) fn validate_name(s: &str, max_len: usize) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    let len = s.chars().count();
    if len > max_len {
        return Err(IdError::TooLong { len, max: max_len });
    }

    if let Some(ch) = s.chars().find(|c| c.is_control()) {
        return Err(IdError::InvalidCharacter {
            ch,
            name: s.to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Instances
// =============================================================================

/// A compute instance ID (`i-` followed by lowercase hex).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    /// The prefix for instance IDs.
    pub const PREFIX: &'static str = "i-";

    /// Parses an instance ID from a string.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some(hex) = s.strip_prefix(Self::PREFIX) else {
            return Err(IdError::MissingPrefix {
                expected: Self::PREFIX,
                actual: s.chars().take(2).collect(),
            });
        };

        if hex.is_empty() {
            return Err(IdError::Empty);
        }

        if let Some(ch) = hex
            .chars()
            .find(|c| !(c.is_ascii_digit() || ('a'..='f').contains(c)))
        {
            return Err(IdError::InvalidCharacter {
                ch,
                name: s.to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }

    /// Borrows the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for InstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_asg_name_roundtrip() {
        let name: AsgName = "nodes.k8s.example.com".parse().unwrap();
        assert_eq!(name.as_str(), "nodes.k8s.example.com");
        assert_eq!(name.to_string(), "nodes.k8s.example.com");
    }

    #[test]
    fn test_asg_name_empty() {
        let result: Result<AsgName, _> = "".parse();
        assert!(matches!(result.unwrap_err(), IdError::Empty));
    }

    #[test]
    fn test_asg_name_too_long() {
        let long = "a".repeat(AsgName::MAX_LEN + 1);
        let result = AsgName::parse(&long);
        assert!(matches!(result.unwrap_err(), IdError::TooLong { .. }));
    }

    #[test]
    fn test_asg_name_control_character() {
        let result = AsgName::parse("nodes\n");
        assert!(matches!(
            result.unwrap_err(),
            IdError::InvalidCharacter { ch: '\n', .. }
        ));
    }

    #[test]
    fn test_asg_name_json_roundtrip() {
        let name = AsgName::parse("workers").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"workers\"");
        let parsed: AsgName = serde_json::from_str(&json).unwrap();
        assert_eq!(name, parsed);
    }

    #[test]
    fn test_asg_name_json_rejects_empty() {
        let result: Result<AsgName, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_launch_config_successor_toggles() {
        let lc = LaunchConfigName::parse("nodes-lc").unwrap();
        let next = lc.successor();
        assert_eq!(next.as_str(), "nodes-lc-0");
        assert_eq!(next.successor(), lc);
    }

    #[test]
    fn test_launch_config_successor_of_bare_suffix() {
        // "-0" on its own has no base to strip back to
        let lc = LaunchConfigName::parse("-0").unwrap();
        assert_eq!(lc.successor().as_str(), "-0-0");
    }

    #[test]
    fn test_launch_config_successor_at_max_len() {
        let lc = LaunchConfigName::parse(&"x".repeat(LaunchConfigName::MAX_LEN)).unwrap();
        let next = lc.successor();
        assert_eq!(next.as_str().len(), LaunchConfigName::MAX_LEN);
        assert!(next.as_str().ends_with("-0"));
    }

    #[test]
    fn test_instance_id_valid() {
        let id: InstanceId = "i-0abc123def4567890".parse().unwrap();
        assert_eq!(id.as_str(), "i-0abc123def4567890");
    }

    #[test]
    fn test_instance_id_missing_prefix() {
        let result = InstanceId::parse("0abc123");
        assert!(result.unwrap_err().is_prefix_error());
    }

    #[test]
    fn test_instance_id_bad_hex() {
        let result = InstanceId::parse("i-xyz");
        assert!(matches!(
            result.unwrap_err(),
            IdError::InvalidCharacter { ch: 'x', .. }
        ));
    }

    #[test]
    fn test_instance_id_prefix_only() {
        assert!(InstanceId::parse("i-").unwrap_err().is_empty());
    }

    proptest! {
        #[test]
        fn prop_instance_id_accepts_hex(hex in "[0-9a-f]{8,17}") {
            let raw = format!("i-{hex}");
            let id = InstanceId::parse(&raw).unwrap();
            prop_assert_eq!(id.as_str(), raw.as_str());
        }

        #[test]
        fn prop_successor_is_involution(base in "[a-z][a-z0-9.-]{0,40}[a-z]") {
            let lc = LaunchConfigName::parse(&base).unwrap();
            prop_assert_eq!(lc.successor().successor(), lc);
        }
    }
}
