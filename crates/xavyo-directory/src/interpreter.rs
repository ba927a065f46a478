//! User account interpreters
//!
//! Convert a raw account status attribute into a disabled flag. The
//! synchronizer applies the result as `enabled = !disabled`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entry::PropertyValue;

/// Interprets the account status value of a person entry.
pub trait UserAccountInterpreter: Send + Sync + fmt::Debug {
    /// `Some(true)` if the account is disabled, `None` if undetermined.
    fn is_account_disabled(&self, status: Option<&PropertyValue>) -> Option<bool>;
}

/// Active Directory `userAccountControl` bit 0x2 (ACCOUNTDISABLE).
#[derive(Debug, Clone, Copy, Default)]
pub struct ActiveDirectoryAccountInterpreter;

const ACCOUNTDISABLE: i64 = 0x2;

impl UserAccountInterpreter for ActiveDirectoryAccountInterpreter {
    fn is_account_disabled(&self, status: Option<&PropertyValue>) -> Option<bool> {
        let raw = status.filter(|v| !v.is_null())?.to_text()?;
        match raw.trim().parse::<i64>() {
            Ok(flags) => Some(flags & ACCOUNTDISABLE != 0),
            Err(e) => {
                tracing::warn!(value = %raw, error = %e, "Unparseable userAccountControl value");
                None
            }
        }
    }
}

/// Generic LDAP interpreter comparing against a configured disabled value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LdapAccountInterpreter {
    /// Value that marks a disabled account.
    #[serde(default)]
    pub disabled_value: String,
    /// Treat an absent status as enabled instead of undetermined.
    #[serde(default)]
    pub accept_null_argument: bool,
}

impl LdapAccountInterpreter {
    pub fn new(disabled_value: impl Into<String>) -> Self {
        Self {
            disabled_value: disabled_value.into(),
            accept_null_argument: false,
        }
    }

    #[must_use]
    pub fn accepting_null(mut self) -> Self {
        self.accept_null_argument = true;
        self
    }
}

impl UserAccountInterpreter for LdapAccountInterpreter {
    fn is_account_disabled(&self, status: Option<&PropertyValue>) -> Option<bool> {
        match status.filter(|v| !v.is_null()).and_then(PropertyValue::to_text) {
            Some(value) => Some(value == self.disabled_value),
            None if self.accept_null_argument => Some(false),
            None => None,
        }
    }
}
