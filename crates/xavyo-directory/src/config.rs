//! LDAP user registry configuration
//!
//! Connection settings and the query, attribute and strictness options of one
//! directory source.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::props;
use crate::error::{DirectoryError, DirectoryResult};

/// Connection settings for one directory server.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Server URL, e.g. `ldaps://ldap.example.com:636`.
    pub url: String,

    /// Bind DN; anonymous bind when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_dn: Option<String>,

    /// Bind password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_password: Option<String>,

    /// Upgrade a plain connection with STARTTLS.
    #[serde(default)]
    pub starttls: bool,

    /// Skip server certificate verification.
    #[serde(default)]
    pub no_tls_verify: bool,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-operation timeout in seconds.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("url", &self.url)
            .field("bind_dn", &self.bind_dn)
            .field(
                "bind_password",
                &self.bind_password.as_ref().map(|_| "***REDACTED***"),
            )
            .field("starttls", &self.starttls)
            .field("no_tls_verify", &self.no_tls_verify)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("operation_timeout_secs", &self.operation_timeout_secs)
            .finish()
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_operation_timeout() -> u64 {
    60
}

impl ConnectionSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bind_dn: None,
            bind_password: None,
            starttls: false,
            no_tls_verify: false,
            connect_timeout_secs: default_connect_timeout(),
            operation_timeout_secs: default_operation_timeout(),
        }
    }

    /// Set simple-bind credentials.
    #[must_use]
    pub fn with_credentials(mut self, bind_dn: impl Into<String>, password: impl Into<String>) -> Self {
        self.bind_dn = Some(bind_dn.into());
        self.bind_password = Some(password.into());
        self
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// Configuration of one LDAP user registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapRegistryConfig {
    /// Whether the source takes part in synchronization.
    #[serde(default = "default_true")]
    pub active: bool,

    pub connection: ConnectionSettings,

    /// Base DN of the group search.
    pub group_search_base: String,

    /// Base DN of the person search.
    pub user_search_base: String,

    #[serde(default = "default_group_query")]
    pub group_query: String,

    /// Differential group query; `{0}` is replaced by the formatted watermark.
    #[serde(default = "default_group_differential_query")]
    pub group_differential_query: String,

    #[serde(default = "default_person_query")]
    pub person_query: String,

    /// Differential person query; `{0}` is replaced by the formatted watermark.
    #[serde(default = "default_person_differential_query")]
    pub person_differential_query: String,

    #[serde(default = "default_group_id_attribute")]
    pub group_id_attribute: String,

    #[serde(default = "default_user_id_attribute")]
    pub user_id_attribute: String,

    #[serde(default = "default_member_attribute")]
    pub member_attribute: String,

    #[serde(default = "default_modify_timestamp_attribute")]
    pub modify_timestamp_attribute: String,

    /// Object class identifying groups in member lookups.
    #[serde(default = "default_group_type")]
    pub group_type: String,

    /// Object class identifying persons in member lookups.
    #[serde(default = "default_person_type")]
    pub person_type: String,

    /// Person property key → directory attribute.
    #[serde(default = "default_person_attribute_mapping")]
    pub person_attribute_mapping: BTreeMap<String, String>,

    #[serde(default)]
    pub person_attribute_defaults: BTreeMap<String, String>,

    /// Group property key → directory attribute.
    #[serde(default = "default_group_attribute_mapping")]
    pub group_attribute_mapping: BTreeMap<String, String>,

    #[serde(default)]
    pub group_attribute_defaults: BTreeMap<String, String>,

    /// Paged results page size; 0 disables paging.
    #[serde(default = "default_query_batch_size")]
    pub query_batch_size: u32,

    /// Range retrieval size for the member attribute; 0 disables range requests.
    #[serde(default)]
    pub attribute_batch_size: u32,

    #[serde(default)]
    pub error_on_missing_members: bool,

    #[serde(default)]
    pub error_on_duplicate_gid: bool,

    #[serde(default)]
    pub error_on_missing_gid: bool,

    #[serde(default)]
    pub error_on_missing_uid: bool,

    /// `chrono` format of the modification timestamp attribute.
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,

    /// Count entries in a pre-pass so cursors can report an estimated size.
    #[serde(default = "default_true")]
    pub enable_progress_estimation: bool,
}

fn default_true() -> bool {
    true
}

fn default_group_query() -> String {
    "(objectclass=groupOfNames)".to_string()
}

fn default_group_differential_query() -> String {
    "(&(objectclass=groupOfNames)(!(modifyTimestamp<={0})))".to_string()
}

fn default_person_query() -> String {
    "(objectclass=inetOrgPerson)".to_string()
}

fn default_person_differential_query() -> String {
    "(&(objectclass=inetOrgPerson)(!(modifyTimestamp<={0})))".to_string()
}

fn default_group_id_attribute() -> String {
    "cn".to_string()
}

fn default_user_id_attribute() -> String {
    "uid".to_string()
}

fn default_member_attribute() -> String {
    "member".to_string()
}

fn default_modify_timestamp_attribute() -> String {
    "modifyTimestamp".to_string()
}

fn default_group_type() -> String {
    "groupOfNames".to_string()
}

fn default_person_type() -> String {
    "inetOrgPerson".to_string()
}

fn default_person_attribute_mapping() -> BTreeMap<String, String> {
    [
        (props::FIRST_NAME, "givenName"),
        (props::LAST_NAME, "sn"),
        (props::EMAIL, "mail"),
        (props::ORGANIZATION_ID, "o"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_group_attribute_mapping() -> BTreeMap<String, String> {
    BTreeMap::from([(
        props::AUTHORITY_DISPLAY_NAME.to_string(),
        "description".to_string(),
    )])
}

fn default_query_batch_size() -> u32 {
    1000
}

fn default_timestamp_format() -> String {
    "%Y%m%d%H%M%SZ".to_string()
}

impl LdapRegistryConfig {
    /// Create a config with default queries and mappings.
    pub fn new(
        connection: ConnectionSettings,
        group_search_base: impl Into<String>,
        user_search_base: impl Into<String>,
    ) -> Self {
        Self {
            active: true,
            connection,
            group_search_base: group_search_base.into(),
            user_search_base: user_search_base.into(),
            group_query: default_group_query(),
            group_differential_query: default_group_differential_query(),
            person_query: default_person_query(),
            person_differential_query: default_person_differential_query(),
            group_id_attribute: default_group_id_attribute(),
            user_id_attribute: default_user_id_attribute(),
            member_attribute: default_member_attribute(),
            modify_timestamp_attribute: default_modify_timestamp_attribute(),
            group_type: default_group_type(),
            person_type: default_person_type(),
            person_attribute_mapping: default_person_attribute_mapping(),
            person_attribute_defaults: BTreeMap::new(),
            group_attribute_mapping: default_group_attribute_mapping(),
            group_attribute_defaults: BTreeMap::new(),
            query_batch_size: default_query_batch_size(),
            attribute_batch_size: 0,
            error_on_missing_members: false,
            error_on_duplicate_gid: false,
            error_on_missing_gid: false,
            error_on_missing_uid: false,
            timestamp_format: default_timestamp_format(),
            enable_progress_estimation: true,
        }
    }

    #[must_use]
    pub fn with_query_batch_size(mut self, size: u32) -> Self {
        self.query_batch_size = size;
        self
    }

    #[must_use]
    pub fn with_attribute_batch_size(mut self, size: u32) -> Self {
        self.attribute_batch_size = size;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> DirectoryResult<()> {
        if self.connection.url.is_empty() {
            return Err(DirectoryError::invalid_configuration(
                "connection url is required",
            ));
        }

        if !(self.connection.url.starts_with("ldap://")
            || self.connection.url.starts_with("ldaps://")
            || self.connection.url.starts_with("ldapi://"))
        {
            return Err(DirectoryError::invalid_configuration(format!(
                "unsupported url scheme: {}",
                self.connection.url
            )));
        }

        if self.connection.bind_dn.is_some() != self.connection.bind_password.is_some() {
            return Err(DirectoryError::invalid_configuration(
                "bind_dn and bind_password must be set together",
            ));
        }

        for (name, value) in [
            ("group_search_base", &self.group_search_base),
            ("user_search_base", &self.user_search_base),
            ("group_query", &self.group_query),
            ("person_query", &self.person_query),
            ("group_id_attribute", &self.group_id_attribute),
            ("user_id_attribute", &self.user_id_attribute),
            ("member_attribute", &self.member_attribute),
            ("modify_timestamp_attribute", &self.modify_timestamp_attribute),
        ] {
            if value.trim().is_empty() {
                return Err(DirectoryError::invalid_configuration(format!(
                    "{name} is required"
                )));
            }
        }

        for (name, query) in [
            ("group_differential_query", &self.group_differential_query),
            ("person_differential_query", &self.person_differential_query),
        ] {
            if !query.contains("{0}") {
                return Err(DirectoryError::invalid_configuration(format!(
                    "{name} must contain the {{0}} timestamp placeholder"
                )));
            }
        }

        if self.timestamp_format.trim().is_empty() {
            return Err(DirectoryError::invalid_configuration(
                "timestamp_format is required",
            ));
        }

        Ok(())
    }

    /// Render a watermark in the directory's timestamp format.
    #[must_use]
    pub fn format_timestamp(&self, timestamp: DateTime<Utc>) -> String {
        timestamp.format(&self.timestamp_format).to_string()
    }

    /// Parse a modification timestamp attribute value.
    pub fn parse_timestamp(&self, value: &str) -> DirectoryResult<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(value, &self.timestamp_format)
            .map(|naive| naive.and_utc())
            .map_err(|e| DirectoryError::InvalidTimestamp {
                value: value.to_string(),
                message: e.to_string(),
            })
    }

    /// Group filter, differential when a watermark is given.
    #[must_use]
    pub fn group_filter(&self, since: Option<DateTime<Utc>>) -> String {
        match since {
            Some(ts) => self
                .group_differential_query
                .replace("{0}", &self.format_timestamp(ts)),
            None => self.group_query.clone(),
        }
    }

    /// Person filter, differential when a watermark is given.
    #[must_use]
    pub fn person_filter(&self, since: Option<DateTime<Utc>>) -> String {
        match since {
            Some(ts) => self
                .person_differential_query
                .replace("{0}", &self.format_timestamp(ts)),
            None => self.person_query.clone(),
        }
    }

    /// Person mapping including the user name key.
    #[must_use]
    pub fn effective_person_mapping(&self) -> BTreeMap<String, String> {
        let mut mapping = self.person_attribute_mapping.clone();
        mapping.insert(props::USER_NAME.to_string(), self.user_id_attribute.clone());
        mapping
    }

    /// Group mapping including the authority name key.
    #[must_use]
    pub fn effective_group_mapping(&self) -> BTreeMap<String, String> {
        let mut mapping = self.group_attribute_mapping.clone();
        mapping.insert(
            props::AUTHORITY_NAME.to_string(),
            self.group_id_attribute.clone(),
        );
        mapping
    }

    /// Member attribute as requested in the main group search.
    #[must_use]
    pub fn member_request_attribute(&self) -> String {
        if self.attribute_batch_size > 0 {
            format!(
                "{};range=0-{}",
                self.member_attribute,
                self.attribute_batch_size - 1
            )
        } else {
            self.member_attribute.clone()
        }
    }

    /// Attributes requested by the person search.
    #[must_use]
    pub fn person_attributes(&self) -> Vec<String> {
        Self::requested_attributes(
            &self.effective_person_mapping(),
            &self.modify_timestamp_attribute,
            None,
        )
    }

    /// Attributes requested by the group search.
    #[must_use]
    pub fn group_attributes(&self) -> Vec<String> {
        Self::requested_attributes(
            &self.effective_group_mapping(),
            &self.modify_timestamp_attribute,
            Some(self.member_request_attribute()),
        )
    }

    fn requested_attributes(
        mapping: &BTreeMap<String, String>,
        timestamp_attribute: &str,
        extra: Option<String>,
    ) -> Vec<String> {
        let mut attributes: std::collections::BTreeSet<String> =
            mapping.values().cloned().collect();
        attributes.insert(timestamp_attribute.to_string());
        attributes.extend(extra);
        attributes.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> LdapRegistryConfig {
        LdapRegistryConfig::new(
            ConnectionSettings::new("ldap://ldap.example.com:389")
                .with_credentials("cn=admin,dc=example,dc=com", "secret"),
            "ou=groups,dc=example,dc=com",
            "ou=users,dc=example,dc=com",
        )
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert!(config.active);
        assert_eq!(config.group_id_attribute, "cn");
        assert_eq!(config.user_id_attribute, "uid");
        assert_eq!(config.member_attribute, "member");
        assert_eq!(config.query_batch_size, 1000);
        assert_eq!(config.attribute_batch_size, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_differential_filter() {
        let config = config();
        let since = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(
            config.group_filter(Some(since)),
            "(&(objectclass=groupOfNames)(!(modifyTimestamp<=20240301123005Z)))"
        );
        assert_eq!(config.group_filter(None), "(objectclass=groupOfNames)");
        assert_eq!(
            config.person_filter(Some(since)),
            "(&(objectclass=inetOrgPerson)(!(modifyTimestamp<=20240301123005Z)))"
        );
    }

    #[test]
    fn test_timestamp_round_trip() {
        let config = config();
        let parsed = config.parse_timestamp("20240301123005Z").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap());
        assert!(config.parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_member_range_attribute() {
        let config = config().with_attribute_batch_size(1500);
        assert_eq!(config.member_request_attribute(), "member;range=0-1499");
        assert!(config
            .group_attributes()
            .contains(&"member;range=0-1499".to_string()));
        assert!(config.group_attributes().contains(&"cn".to_string()));
        assert!(config.person_attributes().contains(&"uid".to_string()));
        assert!(config
            .person_attributes()
            .contains(&"modifyTimestamp".to_string()));
    }

    #[test]
    fn test_validation() {
        let mut invalid = config();
        invalid.connection.url = "http://ldap.example.com".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = config();
        invalid.group_differential_query = "(objectclass=groupOfNames)".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = config();
        invalid.connection.bind_password = None;
        assert!(invalid.validate().is_err());

        let mut invalid = config();
        invalid.user_search_base = String::new();
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let debug = format!("{:?}", config());
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn test_serde_defaults() {
        let json = r#"{
            "connection": {"url": "ldap://ldap.example.com"},
            "group_search_base": "ou=groups,dc=example,dc=com",
            "user_search_base": "ou=users,dc=example,dc=com"
        }"#;
        let parsed: LdapRegistryConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.person_query, "(objectclass=inetOrgPerson)");
        assert_eq!(parsed.connection.connect_timeout_secs, 30);
        assert_eq!(
            parsed.group_attribute_mapping.get(props::AUTHORITY_DISPLAY_NAME),
            Some(&"description".to_string())
        );
        assert!(parsed.validate().is_ok());
    }
}
