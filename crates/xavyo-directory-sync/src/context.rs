//! Explicit per-run context threaded through every phase.

use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};

/// The well-known default tenant.
pub const DEFAULT_TENANT: &str = "";

const TENANT_SEPARATOR: char = '@';

/// Whether `tenant` is the default tenant.
pub fn is_default_tenant(tenant: &str) -> bool {
    tenant == DEFAULT_TENANT
}

/// Qualify a user name with its tenant domain (`user@tenant`).
///
/// Names in the default tenant and names already qualified for `tenant`
/// are returned unchanged.
pub fn qualify_user(tenant: &str, user_name: &str) -> String {
    if is_default_tenant(tenant) {
        return user_name.to_string();
    }
    let suffix = format!("{TENANT_SEPARATOR}{tenant}");
    if user_name.ends_with(&suffix) {
        user_name.to_string()
    } else {
        format!("{user_name}{suffix}")
    }
}

/// The user name without any tenant domain.
pub fn base_user_name(user_name: &str) -> &str {
    user_name
        .split_once(TENANT_SEPARATOR)
        .map_or(user_name, |(base, _)| base)
}

/// Tenant and cancellation state for one synchronization run.
#[derive(Debug, Clone)]
pub struct SyncContext {
    tenant: String,
    cancel: CancellationToken,
}

impl SyncContext {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Share an existing cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn is_default_tenant(&self) -> bool {
        is_default_tenant(&self.tenant)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn qualify_user(&self, user_name: &str) -> String {
        qualify_user(&self.tenant, user_name)
    }

    /// Fail with [`SyncError::LockLost`] once the run has been cancelled.
    pub fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::lock_lost(&self.tenant));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualify_user() {
        assert_eq!(qualify_user(DEFAULT_TENANT, "alice"), "alice");
        assert_eq!(qualify_user("acme.com", "alice"), "alice@acme.com");
        assert_eq!(qualify_user("acme.com", "alice@acme.com"), "alice@acme.com");
        assert_eq!(base_user_name("alice@acme.com"), "alice");
        assert_eq!(base_user_name("alice"), "alice");
    }

    #[test]
    fn test_cancellation() {
        let ctx = SyncContext::new("acme.com");
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancellation().cancel();
        let err = ctx.check_cancelled().unwrap_err();
        assert!(matches!(err, SyncError::LockLost { ref tenant } if tenant == "acme.com"));
    }
}
