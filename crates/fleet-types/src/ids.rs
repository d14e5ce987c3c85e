//! Runner instance identifiers
//!
//! A runner name is `prefix + separator + suffix`. The prefix identifies the
//! manager that owns the runner, the separator records how the runner was
//! spawned (`-` pre-provisioned, `r` reactive) and the suffix is random.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum runner name length accepted by GitHub
pub const MAX_NAME_LENGTH: usize = 64;

/// Length of generated suffixes in hex characters (48 bits)
pub const SUFFIX_LENGTH: usize = 12;

const SEPARATOR: char = '-';
const REACTIVE_SEPARATOR: char = 'r';

/// Errors building or parsing an [`InstanceId`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("Runner name prefix must not be empty")]
    EmptyPrefix,

    #[error("Runner name for prefix {prefix} would be {length} characters, limit is {limit}")]
    TooLong {
        prefix: String,
        length: usize,
        limit: usize,
    },

    #[error("Runner name {name} does not belong to prefix {prefix}")]
    InvalidName { prefix: String, name: String },
}

/// Canonical identifier of a runner instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId {
    prefix: String,
    reactive: bool,
    suffix: String,
}

impl InstanceId {
    /// Build a fresh identifier with a random suffix
    pub fn build(prefix: impl Into<String>, reactive: bool) -> Result<Self, IdentityError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(IdentityError::EmptyPrefix);
        }

        let length = prefix.len() + 1 + SUFFIX_LENGTH;
        if length > MAX_NAME_LENGTH {
            return Err(IdentityError::TooLong {
                prefix,
                length,
                limit: MAX_NAME_LENGTH,
            });
        }

        Ok(Self {
            prefix,
            reactive,
            suffix: random_suffix(),
        })
    }

    /// Reconstruct an identifier from an existing runner name
    ///
    /// Names from older deployments carry suffixes of other lengths; any
    /// non-empty lowercase hex suffix is accepted. The reactive separator is
    /// not a hex digit, so `name` never claims a runner of `name-1`.
    pub fn build_from_name(prefix: &str, name: &str) -> Result<Self, IdentityError> {
        let invalid = || IdentityError::InvalidName {
            prefix: prefix.to_string(),
            name: name.to_string(),
        };

        if prefix.is_empty() {
            return Err(IdentityError::EmptyPrefix);
        }

        let rest = name.strip_prefix(prefix).ok_or_else(invalid)?;
        let mut chars = rest.chars();
        let reactive = match chars.next() {
            Some(SEPARATOR) => false,
            Some(REACTIVE_SEPARATOR) => true,
            _ => return Err(invalid()),
        };

        let suffix = chars.as_str();
        if suffix.is_empty() || !suffix.chars().all(is_suffix_char) {
            return Err(invalid());
        }

        Ok(Self {
            prefix: prefix.to_string(),
            reactive,
            suffix: suffix.to_string(),
        })
    }

    /// Whether `name` starts with `prefix` immediately followed by a separator
    ///
    /// A plain `starts_with` is not enough: `name-1` must not claim
    /// `name-11-abc`.
    pub fn name_has_prefix(prefix: &str, name: &str) -> bool {
        match name.strip_prefix(prefix) {
            Some(rest) => matches!(rest.chars().next(), Some(SEPARATOR | REACTIVE_SEPARATOR)),
            None => false,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn reactive(&self) -> bool {
        self.reactive
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Full runner name as used on the cloud and the platform
    pub fn name(&self) -> String {
        let separator = if self.reactive {
            REACTIVE_SEPARATOR
        } else {
            SEPARATOR
        };
        format!("{}{}{}", self.prefix, separator, self.suffix)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

fn is_suffix_char(c: char) -> bool {
    matches!(c, '0'..='9' | 'a'..='f')
}

fn random_suffix() -> String {
    let mut bytes = [0u8; SUFFIX_LENGTH / 2];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
