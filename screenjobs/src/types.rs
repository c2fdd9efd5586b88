use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Length of the textual form of an identifier.
pub const ID_LENGTH: usize = 32;
/// Length of the abbreviated form used in logs.
pub const SHORT_ID_LENGTH: usize = 16;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// The first 16 characters, enough to tell ids apart in logs.
            pub fn short(&self) -> String {
                let mut text = self.to_string();
                text.truncate(SHORT_ID_LENGTH);
                text
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.simple())
            }
        }

        impl FromStr for $name {
            type Err = InvalidId;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.len() != ID_LENGTH {
                    return Err(InvalidId(s.to_string()));
                }
                Uuid::try_parse(s)
                    .map(Self)
                    .map_err(|_| InvalidId(s.to_string()))
            }
        }
    };
}

opaque_id!(
    /// Identifies a job. Renders as 32 lowercase hex characters.
    JobId
);

opaque_id!(
    /// Identifies one execution attempt and its run log entry.
    RunId
);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("not a valid identifier: {0:?}")]
pub struct InvalidId(pub String);

/// Weak reference to a user entity owned by someone else.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerRef(pub String);

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a job's output goes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPrivilege {
    /// The job draws to its own simulation.
    #[default]
    Simulate,
    /// The job drives the shared screen.
    Hardware,
}

/// Why a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The process exited by itself.
    Natural,
    /// The system stopped it.
    System,
    /// An administrator stopped it.
    Admin,
    /// It outlived its maximum runtime.
    Timeout,
}

impl ExitReason {
    pub fn for_stop(is_admin_action: bool) -> Self {
        if is_admin_action {
            ExitReason::Admin
        } else {
            ExitReason::System
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_a_fixed_length_text_form() {
        let id = JobId::new();
        let text = id.to_string();
        assert_eq!(text.len(), ID_LENGTH);
        assert_eq!(text.parse::<JobId>(), Ok(id));
        assert_eq!(id.short(), text[..SHORT_ID_LENGTH]);
    }

    #[test]
    fn hyphenated_or_short_tokens_are_rejected() {
        let id = RunId::new();
        let hyphenated = uuid::Uuid::parse_str(&id.to_string())
            .expect("uuid")
            .hyphenated()
            .to_string();
        assert!(hyphenated.parse::<RunId>().is_err());
        assert!("abc".parse::<RunId>().is_err());
    }
}
