//! Workload names and endpoint roles
//!
//! A [`WorkloadName`] is the join key between the launch service, the
//! provisioning metadata on each unit, lease keys and name records. It is a
//! DNS label, so it can be embedded in record names and filters without
//! escaping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length of a DNS label
pub const MAX_NAME_LEN: usize = 63;

/// Names taken by the launch service's own GET routes
pub const RESERVED_NAMES: &[&str] = &["health", "version"];

/// Error returned when a workload name fails validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidName {
    #[error("workload name is empty")]
    Empty,
    #[error("workload name is longer than 63 characters")]
    TooLong,
    #[error("workload name contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("workload name must not start or end with a hyphen")]
    EdgeHyphen,
    #[error("workload name {0:?} is reserved")]
    Reserved(String),
}

/// A validated, DNS-label-safe workload identifier, stored lowercase
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkloadName(String);

impl WorkloadName {
    /// Validate and wrap a workload name. Names are case-insensitive like the
    /// DNS records they end up in, so `Demo` and `demo` are one workload.
    pub fn parse(raw: &str) -> Result<Self, InvalidName> {
        if raw.is_empty() {
            return Err(InvalidName::Empty);
        }
        if raw.len() > MAX_NAME_LEN {
            return Err(InvalidName::TooLong);
        }
        if let Some(c) = raw.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '-')) {
            return Err(InvalidName::InvalidChar(c));
        }
        if raw.starts_with('-') || raw.ends_with('-') {
            return Err(InvalidName::EdgeHyphen);
        }
        let name = raw.to_ascii_lowercase();
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(InvalidName::Reserved(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkloadName {
    type Err = InvalidName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for WorkloadName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for WorkloadName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// The two endpoint roles of a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Public-reachable relay
    Frontend,
    /// Private compute unit
    Backend,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Frontend => "frontend",
            Role::Backend => "backend",
        }
    }

    /// Host name of this role's endpoint of `workload`, e.g. `frontend.demo`.
    /// Used for name records and as the unit's network alias.
    pub fn endpoint_host(&self, workload: &str) -> String {
        format!("{}.{}", self, workload)
    }

    /// The role this role's health monitor probes
    pub fn peer(&self) -> Role {
        match self {
            Role::Frontend => Role::Backend,
            Role::Backend => Role::Frontend,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "frontend" => Ok(Role::Frontend),
            "backend" => Ok(Role::Backend),
            other => Err(format!("unknown role '{}', expected 'frontend' or 'backend'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["demo", "a", "my-app-2", "A1b2", &"x".repeat(63)] {
            assert!(WorkloadName::parse(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_invalid_names() {
        assert_eq!(WorkloadName::parse(""), Err(InvalidName::Empty));
        assert_eq!(WorkloadName::parse(&"x".repeat(64)), Err(InvalidName::TooLong));
        assert_eq!(WorkloadName::parse("-demo"), Err(InvalidName::EdgeHyphen));
        assert_eq!(WorkloadName::parse("demo-"), Err(InvalidName::EdgeHyphen));
        assert_eq!(WorkloadName::parse("de.mo"), Err(InvalidName::InvalidChar('.')));
        assert_eq!(WorkloadName::parse("demo*"), Err(InvalidName::InvalidChar('*')));
        assert_eq!(WorkloadName::parse("de mo"), Err(InvalidName::InvalidChar(' ')));
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let upper = WorkloadName::parse("Demo-App").unwrap();
        assert_eq!(upper.as_str(), "demo-app");
        assert_eq!(upper, WorkloadName::parse("demo-app").unwrap());
    }

    #[test]
    fn test_route_names_are_reserved() {
        assert_eq!(WorkloadName::parse("health"), Err(InvalidName::Reserved("health".to_string())));
        assert_eq!(WorkloadName::parse("Version"), Err(InvalidName::Reserved("version".to_string())));
        assert!(WorkloadName::parse("healthy").is_ok());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Result<WorkloadName, _> = serde_json::from_str("\"demo\"");
        assert!(ok.is_ok());
        let bad: Result<WorkloadName, _> = serde_json::from_str("\"../etc\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_role_roundtrip() {
        assert_eq!("frontend".parse::<Role>().unwrap(), Role::Frontend);
        assert_eq!("backend".parse::<Role>().unwrap(), Role::Backend);
        assert!("proxy".parse::<Role>().is_err());
        assert_eq!(Role::Frontend.peer(), Role::Backend);
        assert_eq!(Role::Backend.peer(), Role::Frontend);
        assert_eq!(Role::Frontend.endpoint_host("demo"), "frontend.demo");
    }
}
