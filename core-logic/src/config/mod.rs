use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A remote ledger node the spammer talks to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub url: String,
    /// Delegate proof-of-work to the node's `attachToTangle` instead of sealing locally.
    #[serde(default)]
    pub attach_to_tangle: bool,
}

impl Node {
    pub fn new(url: impl Into<String>, attach_to_tangle: bool) -> Self {
        Self {
            url: url.into(),
            attach_to_tangle,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attach_to_tangle {
            write!(f, "{} (remote PoW)", self.url)
        } else {
            write!(f, "{}", self.url)
        }
    }
}

/// Address security level; the number of 81-trit key fragments per signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SecurityLevel {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Default for SecurityLevel {
    fn default() -> Self {
        SecurityLevel::Medium
    }
}

impl TryFrom<u8> for SecurityLevel {
    type Error = ConfigError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(SecurityLevel::Low),
            2 => Ok(SecurityLevel::Medium),
            3 => Ok(SecurityLevel::High),
            other => Err(ConfigError::InvalidValue {
                field: "security_level".to_string(),
                reason: format!("{} is not one of 1, 2, 3", other),
            }),
        }
    }
}

impl From<SecurityLevel> for u8 {
    fn from(level: SecurityLevel) -> Self {
        level as u8
    }
}
