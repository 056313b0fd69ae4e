use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const MAX_TARGET_LEN: usize = 256;

/// Identifier of a piece of third-party code, optionally pinned to a version.
///
/// Textual form is `action` or `action@version`, e.g. `summarize@v2` or
/// `acme.pdf/extract@1.4.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionTarget {
    pub action: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetParseError {
    #[error("action target is empty")]
    Empty,
    #[error("action target exceeds {MAX_TARGET_LEN} bytes")]
    TooLong,
    #[error("action target has an empty {0}")]
    EmptyPart(&'static str),
    #[error("action target contains invalid character {0:?}")]
    InvalidChar(char),
}

impl ActionTarget {
    pub fn new(action: impl Into<String>, version: Option<String>) -> Self {
        Self {
            action: action.into(),
            version,
        }
    }
}

fn check_part(part: &str, name: &'static str) -> Result<(), TargetParseError> {
    if part.is_empty() {
        return Err(TargetParseError::EmptyPart(name));
    }
    if let Some(c) = part
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':')))
    {
        return Err(TargetParseError::InvalidChar(c));
    }
    Ok(())
}

impl FromStr for ActionTarget {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TargetParseError::Empty);
        }
        if s.len() > MAX_TARGET_LEN {
            return Err(TargetParseError::TooLong);
        }
        match s.split_once('@') {
            Some((action, version)) => {
                check_part(action, "action")?;
                check_part(version, "version")?;
                Ok(Self::new(action, Some(version.to_string())))
            }
            None => {
                check_part(s, "action")?;
                Ok(Self::new(s, None))
            }
        }
    }
}

impl fmt::Display for ActionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}@{}", self.action, v),
            None => f.write_str(&self.action),
        }
    }
}

impl Serialize for ActionTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ActionTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
