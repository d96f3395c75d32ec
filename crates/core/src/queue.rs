//! Queue names.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

const MAX_QUEUE_NAME_LEN: usize = 48;

/// Name of a queue domain (e.g. `calendar_sync`).
///
/// Each queue owns a physical table named `<queue>_jobs`, so the name is
/// restricted to `[a-z][a-z0-9_]*` and at most 48 bytes. Anything accepted here
/// is safe to splice into SQL as an identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        validate(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Physical table holding this queue's job rows.
    pub fn jobs_table(&self) -> String {
        format!("{}_jobs", self.0)
    }
}

fn validate(name: &str) -> Result<(), DomainError> {
    if name.is_empty() || name.len() > MAX_QUEUE_NAME_LEN {
        return Err(DomainError::validation(format!(
            "queue name must be 1..={MAX_QUEUE_NAME_LEN} bytes, got {}",
            name.len()
        )));
    }

    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !first_ok || !rest_ok {
        return Err(DomainError::validation(format!(
            "queue name '{name}' must match [a-z][a-z0-9_]*"
        )));
    }

    Ok(())
}

impl core::fmt::Display for QueueName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for QueueName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for QueueName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl core::borrow::Borrow<str> for QueueName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_snake_case_names() {
        let name = QueueName::new("calendar_sync").unwrap();
        assert_eq!(name.as_str(), "calendar_sync");
        assert_eq!(name.jobs_table(), "calendar_sync_jobs");
    }

    #[test]
    fn rejects_names_unsafe_as_identifiers() {
        for bad in ["", "Calendar", "1queue", "jobs; drop table x", "a-b", "_x"] {
            assert!(QueueName::new(bad).is_err(), "{bad:?} should be rejected");
        }

        let too_long = "q".repeat(MAX_QUEUE_NAME_LEN + 1);
        assert!(QueueName::new(too_long).is_err());
    }

    #[test]
    fn deserialization_validates() {
        let ok: QueueName = serde_json::from_str("\"ai_jobs\"").unwrap();
        assert_eq!(ok.as_str(), "ai_jobs");

        assert!(serde_json::from_str::<QueueName>("\"AI Jobs\"").is_err());
    }
}
