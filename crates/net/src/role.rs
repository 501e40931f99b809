//! Server role.
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Which of the two cooperating servers this process is.
///
/// Fixed at startup from the CLI and immutable for the process's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerRole {
    /// Status Server: tracks sensor failure state, initiates `CHECKALERT`.
    Status,
    /// Location Server: tracks sensor location, answers `CHECKALERT`.
    Location,
}

impl ServerRole {
    pub fn is_status(&self) -> bool {
        matches!(self, Self::Status)
    }

    pub fn is_location(&self) -> bool {
        matches!(self, Self::Location)
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => write!(f, "SS"),
            Self::Location => write!(f, "SL"),
        }
    }
}

/// Error returned when a role token doesn't match `SS` or `SL`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid role `{0}`, expected SS or SL")]
pub struct RoleParseError(String);

impl FromStr for ServerRole {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SS" => Ok(Self::Status),
            "SL" => Ok(Self::Location),
            other => Err(RoleParseError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_roles() {
        assert_eq!("SS".parse::<ServerRole>().unwrap(), ServerRole::Status);
        assert_eq!("SL".parse::<ServerRole>().unwrap(), ServerRole::Location);
    }

    #[test]
    fn rejects_unknown_role() {
        assert!("ss".parse::<ServerRole>().is_err());
        assert!("SX".parse::<ServerRole>().is_err());
    }
}
