//! LDAP session adapter
//!
//! Implements [`DirectorySession`] over `ldap3` with the simple paged results
//! control. Each session owns one bound connection driven on its own task.

use async_trait::async_trait;
use ldap3::controls::{ControlType, PagedResults, RawControl};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry};
use tracing::{debug, info, instrument, warn};

use crate::config::ConnectionSettings;
use crate::entry::RawEntry;
use crate::error::{DirectoryError, DirectoryResult};
use crate::session::{DirectorySession, PageCookie, SearchPage, SearchRequest, SessionProvider};

const RC_INVALID_CREDENTIALS: u32 = 49;
const RC_NO_SUCH_OBJECT: u32 = 32;

/// Opens bound `ldap3` sessions for one server.
#[derive(Debug, Clone)]
pub struct LdapSessionProvider {
    settings: ConnectionSettings,
}

impl LdapSessionProvider {
    #[must_use]
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }

    #[must_use]
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }
}

#[async_trait]
impl SessionProvider for LdapSessionProvider {
    #[instrument(skip(self), fields(url = %self.settings.url))]
    async fn open(&self) -> DirectoryResult<Box<dyn DirectorySession>> {
        let settings = &self.settings;
        debug!("Connecting to LDAP server");

        let conn_settings = LdapConnSettings::new()
            .set_conn_timeout(settings.connect_timeout())
            .set_starttls(settings.starttls)
            .set_no_tls_verify(settings.no_tls_verify);

        let (conn, mut ldap) = LdapConnAsync::with_settings(conn_settings, &settings.url)
            .await
            .map_err(|e| {
                DirectoryError::connection_failed_with_source(
                    format!("Failed to connect to LDAP server at {}", settings.url),
                    e,
                )
            })?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        let bind_dn = settings.bind_dn.as_deref().unwrap_or("");
        let bind_password = settings.bind_password.as_deref().unwrap_or("");
        debug!(bind_dn = %bind_dn, "Performing LDAP bind");

        let result = ldap
            .with_timeout(settings.operation_timeout())
            .simple_bind(bind_dn, bind_password)
            .await
            .map_err(|e| map_ldap_error("LDAP bind failed", e))?;

        if result.rc != 0 {
            if result.rc == RC_INVALID_CREDENTIALS {
                return Err(DirectoryError::AuthenticationFailed);
            }
            return Err(DirectoryError::connection_failed(format!(
                "LDAP bind failed with code {}: {}",
                result.rc, result.text
            )));
        }

        info!(url = %settings.url, "LDAP connection established");
        Ok(Box::new(LdapSession {
            ldap,
            operation_timeout: settings.operation_timeout(),
        }))
    }
}

/// One bound LDAP connection.
pub struct LdapSession {
    ldap: Ldap,
    operation_timeout: std::time::Duration,
}

impl std::fmt::Debug for LdapSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapSession")
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DirectorySession for LdapSession {
    async fn search_page(
        &mut self,
        request: &SearchRequest,
        cookie: Option<&PageCookie>,
    ) -> DirectoryResult<SearchPage> {
        let attrs: Vec<&str> = request.attributes.iter().map(String::as_str).collect();

        let ldap = self.ldap.with_timeout(self.operation_timeout);
        let ldap = if request.page_size > 0 {
            let control = PagedResults {
                size: request.page_size as i32,
                cookie: cookie.map(|c| c.as_bytes().to_vec()).unwrap_or_default(),
            };
            ldap.with_controls(vec![RawControl::from(control)])
        } else {
            ldap
        };

        let (rows, result) = ldap
            .search(&request.base, Scope::Subtree, &request.filter, attrs)
            .await
            .map_err(|e| map_ldap_error("LDAP search failed", e))?
            .success()
            .map_err(|e| map_ldap_error("LDAP search failed", e))?;

        let next = result.ctrls.iter().find_map(|ctrl| match ctrl.0 {
            Some(ControlType::PagedResults) => Some(ctrl.1.parse::<PagedResults>().cookie),
            _ => None,
        });

        let entries = rows
            .into_iter()
            .map(SearchEntry::construct)
            .map(raw_entry)
            .collect();

        Ok(SearchPage {
            entries,
            cookie: next.filter(|c: &Vec<u8>| !c.is_empty()).map(PageCookie::new),
        })
    }

    async fn read_entry(
        &mut self,
        dn: &str,
        attributes: &[String],
    ) -> DirectoryResult<Option<RawEntry>> {
        let attrs: Vec<&str> = attributes.iter().map(String::as_str).collect();
        let result = self
            .ldap
            .with_timeout(self.operation_timeout)
            .search(dn, Scope::Base, "(objectClass=*)", attrs)
            .await
            .map_err(|e| map_ldap_error("LDAP lookup failed", e))?
            .success();

        match result {
            Ok((rows, _)) => Ok(rows
                .into_iter()
                .next()
                .map(|row| raw_entry(SearchEntry::construct(row)))),
            Err(LdapError::LdapResult { result }) if result.rc == RC_NO_SUCH_OBJECT => Ok(None),
            Err(e) => Err(map_ldap_error("LDAP lookup failed", e)),
        }
    }

    async fn close(&mut self) -> DirectoryResult<()> {
        self.ldap
            .unbind()
            .await
            .map_err(|e| map_ldap_error("LDAP unbind failed", e))
    }
}

fn raw_entry(entry: SearchEntry) -> RawEntry {
    RawEntry {
        dn: entry.dn,
        attrs: entry.attrs,
        bin_attrs: entry.bin_attrs,
    }
}

/// Classify an `ldap3` error; transport failures become resumable.
fn map_ldap_error(context: &str, error: LdapError) -> DirectoryError {
    match error {
        LdapError::Timeout { .. } => DirectoryError::communication_with_source(
            format!("{context}: operation timed out"),
            error,
        ),
        LdapError::Io { .. }
        | LdapError::EndOfStream
        | LdapError::OpSend { .. }
        | LdapError::ResultRecv { .. } => DirectoryError::communication_with_source(context, error),
        LdapError::LdapResult { ref result } if result.rc == RC_INVALID_CREDENTIALS => {
            DirectoryError::AuthenticationFailed
        }
        other => DirectoryError::search_failed_with_source(context, other),
    }
}
