use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::PolicySet;

/// The message returned for denials when debug mode is off.
pub const NOT_AUTHORIZED: &str = "Not authorized!";

/// The result of validating a query.
///
/// Serializes as `{"isAllowed": bool, "message": string}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub is_allowed: bool,
    /// Empty when the query is allowed.
    pub message: String,
}

impl Verdict {
    pub fn allowed() -> Self {
        Self {
            is_allowed: true,
            message: String::new(),
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            is_allowed: false,
            message: message.into(),
        }
    }
}

/// What happens to fields the rules say nothing about.
///
/// It is also the root policy every rule inherits from.
///
/// # Example
///
/// ```
/// use fieldgate::DefaultPolicy;
///
/// assert_eq!("accept".parse::<DefaultPolicy>().unwrap(), DefaultPolicy::Accept);
/// assert_eq!(DefaultPolicy::default(), DefaultPolicy::Drop);
/// assert!("maybe".parse::<DefaultPolicy>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DefaultPolicy {
    /// Deny unless a rule accepts.
    #[default]
    Drop,
    /// Allow unless a rule drops.
    Accept,
}

impl DefaultPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            DefaultPolicy::Drop => "DROP",
            DefaultPolicy::Accept => "ACCEPT",
        }
    }

    /// The policy at the root of every compiled rule tree.
    pub fn root_policy(self) -> PolicySet {
        match self {
            DefaultPolicy::Drop => PolicySet::drop_all(),
            DefaultPolicy::Accept => PolicySet::accept_all(),
        }
    }
}

impl fmt::Display for DefaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DefaultPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DROP" => Ok(DefaultPolicy::Drop),
            "ACCEPT" => Ok(DefaultPolicy::Accept),
            _ => Err(ConfigError::InvalidPolicy(s.to_string())),
        }
    }
}
