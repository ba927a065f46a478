//! Directory entry value objects
//!
//! Raw rows as returned by a directory session, and the mapped
//! [`DirectoryEntry`] handed to the synchronization analyzer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix that marks an authority name as a group.
pub const GROUP_PREFIX: &str = "GROUP_";

/// Well-known property keys.
pub mod props {
    /// Person user name (mapped from the user id attribute).
    pub const USER_NAME: &str = "userName";
    /// Group authority name (`GROUP_` + group id).
    pub const AUTHORITY_NAME: &str = "authorityName";
    /// Group display name.
    pub const AUTHORITY_DISPLAY_NAME: &str = "authorityDisplayName";
    pub const FIRST_NAME: &str = "firstName";
    pub const LAST_NAME: &str = "lastName";
    pub const EMAIL: &str = "email";
    pub const ORGANIZATION_ID: &str = "organizationId";
    /// Whether the account may log in.
    pub const ENABLED: &str = "enabled";
    /// Avatar image, carried as [`super::PropertyValue::Avatar`].
    pub const AVATAR: &str = "avatar";
    /// Raw account status consumed by a user account interpreter.
    pub const ACCOUNT_STATUS: &str = "userAccountStatusProperty";
}

/// Kind of identity-store authority, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityKind {
    User,
    Group,
}

impl AuthorityKind {
    /// Classify an authority name.
    #[must_use]
    pub fn of(name: &str) -> Self {
        if name.starts_with(GROUP_PREFIX) {
            AuthorityKind::Group
        } else {
            AuthorityKind::User
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorityKind::User => "user",
            AuthorityKind::Group => "group",
        }
    }

    /// Full authority name for a short name of this kind.
    #[must_use]
    pub fn authority_name(&self, short_name: &str) -> String {
        match self {
            AuthorityKind::User => short_name.to_string(),
            AuthorityKind::Group => format!("{GROUP_PREFIX}{short_name}"),
        }
    }
}

impl fmt::Display for AuthorityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Short name of an authority (group prefix stripped).
#[must_use]
pub fn short_name(authority: &str) -> &str {
    authority.strip_prefix(GROUP_PREFIX).unwrap_or(authority)
}

/// Binary avatar payload produced by the avatar attribute mapper.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarBlob {
    data: Vec<u8>,
}

impl AvatarBlob {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for AvatarBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvatarBlob")
            .field("len", &self.data.len())
            .finish()
    }
}

/// Mapped property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    /// Explicitly cleared; the store removes the property.
    Null,
    String(String),
    Boolean(bool),
    Binary(Vec<u8>),
    Avatar(AvatarBlob),
    Array(Vec<PropertyValue>),
}

impl PropertyValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    /// String view of scalar text values.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Render a value as text the way an attribute filter or a log line sees it.
    #[must_use]
    pub fn to_text(&self) -> Option<String> {
        match self {
            PropertyValue::Null => None,
            PropertyValue::String(s) => Some(s.clone()),
            PropertyValue::Boolean(b) => Some(b.to_string()),
            PropertyValue::Binary(b) => Some(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                b,
            )),
            PropertyValue::Avatar(a) => Some(format!("<avatar {} bytes>", a.data().len())),
            PropertyValue::Array(values) => {
                let parts: Vec<String> = values.iter().filter_map(Self::to_text).collect();
                Some(parts.join(","))
            }
        }
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Boolean(value)
    }
}

/// Property map keyed by property key.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// A user or group as read from a directory source.
///
/// Built by the registry per result row and immutable once it leaves the
/// cursor; duplicate rows are folded in with [`DirectoryEntry::merge`] before
/// emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    source_id: String,
    id: String,
    properties: PropertyMap,
    last_modified: Option<DateTime<Utc>>,
    child_associations: BTreeSet<String>,
}

impl DirectoryEntry {
    /// Create an entry for the row at `source_id` with normalized id `id`.
    pub fn new(source_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            id: id.into(),
            properties: PropertyMap::new(),
            last_modified: None,
            child_associations: BTreeSet::new(),
        }
    }

    /// Set a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    /// Add member ids.
    #[must_use]
    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.child_associations
            .extend(children.into_iter().map(Into::into));
        self
    }

    pub(crate) fn properties_mut(&mut self) -> &mut PropertyMap {
        &mut self.properties
    }

    pub(crate) fn set_last_modified(&mut self, last_modified: Option<DateTime<Utc>>) {
        self.last_modified = last_modified;
    }

    pub(crate) fn children_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.child_associations
    }

    /// Opaque directory identifier (distinguished name).
    #[must_use]
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Normalized short identity-store id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    #[must_use]
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    #[must_use]
    pub fn child_associations(&self) -> &BTreeSet<String> {
        &self.child_associations
    }

    /// Fold a duplicate row of the same id into this entry.
    ///
    /// Children are unioned, properties of `other` win, and the most recent
    /// modification time is kept.
    pub fn merge(&mut self, other: DirectoryEntry) {
        self.child_associations.extend(other.child_associations);
        self.properties.extend(other.properties);
        self.last_modified = match (self.last_modified, other.last_modified) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// One raw attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    Text(String),
    Binary(Vec<u8>),
}

impl RawValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RawValue::Text(s) => Some(s),
            RawValue::Binary(_) => None,
        }
    }
}

/// A result row as returned by a directory session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntry {
    /// Distinguished name of the row.
    pub dn: String,
    /// Text attributes.
    pub attrs: HashMap<String, Vec<String>>,
    /// Binary attributes.
    pub bin_attrs: HashMap<String, Vec<Vec<u8>>>,
}

impl RawEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            ..Self::default()
        }
    }

    /// Add text values for an attribute.
    #[must_use]
    pub fn with_attr<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attrs
            .entry(name.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Add a binary value for an attribute.
    #[must_use]
    pub fn with_binary(mut self, name: impl Into<String>, value: Vec<u8>) -> Self {
        self.bin_attrs.entry(name.into()).or_default().push(value);
        self
    }

    /// Values of an attribute, matched case-insensitively by exact name.
    ///
    /// Returns the attribute name as sent by the server together with its values.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<(&str, Vec<RawValue>)> {
        self.find(|attr| attr.eq_ignore_ascii_case(name))
    }

    /// Values of a possibly range-restricted attribute.
    ///
    /// Prefers the unrestricted attribute and falls back to the first attribute
    /// whose name starts with `name;` (for example `member;range=0-1499`).
    #[must_use]
    pub fn range_attribute(&self, name: &str) -> Option<(&str, Vec<RawValue>)> {
        if let Some(found) = self.attribute(name) {
            return Some(found);
        }
        let prefix = format!("{};", name.to_ascii_lowercase());
        self.find(|attr| attr.to_ascii_lowercase().starts_with(&prefix))
    }

    /// First text value of an attribute.
    #[must_use]
    pub fn first_text(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(attr, _)| attr.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    fn find(&self, matches: impl Fn(&str) -> bool) -> Option<(&str, Vec<RawValue>)> {
        if let Some((attr, values)) = self.attrs.iter().find(|(attr, _)| matches(attr)) {
            return Some((
                attr.as_str(),
                values.iter().cloned().map(RawValue::Text).collect(),
            ));
        }
        self.bin_attrs
            .iter()
            .find(|(attr, _)| matches(attr))
            .map(|(attr, values)| {
                (
                    attr.as_str(),
                    values.iter().cloned().map(RawValue::Binary).collect(),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_authority_kind_of() {
        assert_eq!(AuthorityKind::of("GROUP_Development"), AuthorityKind::Group);
        assert_eq!(AuthorityKind::of("mmustermann"), AuthorityKind::User);
        assert_eq!(AuthorityKind::Group.authority_name("dev"), "GROUP_dev");
        assert_eq!(short_name("GROUP_dev"), "dev");
        assert_eq!(short_name("jdoe"), "jdoe");
    }

    #[test]
    fn test_merge_unions_children_and_keeps_latest_timestamp() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        let mut first = DirectoryEntry::new("cn=dev,ou=a", "dev")
            .with_property(props::AUTHORITY_DISPLAY_NAME, "Dev")
            .with_last_modified(t2)
            .with_children(["alice"]);
        let second = DirectoryEntry::new("cn=dev,ou=b", "dev")
            .with_property(props::AUTHORITY_DISPLAY_NAME, "Development")
            .with_last_modified(t1)
            .with_children(["bob"]);

        first.merge(second);

        assert_eq!(first.child_associations().len(), 2);
        assert_eq!(first.last_modified(), Some(t2));
        assert_eq!(
            first.property(props::AUTHORITY_DISPLAY_NAME),
            Some(&PropertyValue::from("Development"))
        );
    }

    #[test]
    fn test_merge_with_missing_timestamp() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut first = DirectoryEntry::new("cn=a", "a");
        first.merge(DirectoryEntry::new("cn=a2", "a").with_last_modified(t1));
        assert_eq!(first.last_modified(), Some(t1));
    }

    #[test]
    fn test_raw_entry_case_insensitive_lookup() {
        let raw = RawEntry::new("cn=dev,dc=example,dc=com")
            .with_attr("CN", ["dev"])
            .with_attr("member;range=0-1", ["uid=a", "uid=b"]);

        let (name, values) = raw.attribute("cn").unwrap();
        assert_eq!(name, "CN");
        assert_eq!(values, vec![RawValue::Text("dev".to_string())]);

        let (name, values) = raw.range_attribute("member").unwrap();
        assert_eq!(name, "member;range=0-1");
        assert_eq!(values.len(), 2);

        assert!(raw.attribute("member").is_none());
        assert_eq!(raw.first_text("cn"), Some("dev"));
    }

    #[test]
    fn test_raw_entry_binary_attribute() {
        let raw = RawEntry::new("cn=x").with_binary("jpegPhoto", vec![1, 2, 3]);
        let (_, values) = raw.attribute("jpegphoto").unwrap();
        assert_eq!(values, vec![RawValue::Binary(vec![1, 2, 3])]);
    }

    #[test]
    fn test_property_value_text() {
        assert_eq!(PropertyValue::Null.to_text(), None);
        assert_eq!(
            PropertyValue::Array(vec!["a".into(), "b".into()]).to_text(),
            Some("a,b".to_string())
        );
        assert_eq!(PropertyValue::Binary(vec![0xff]).to_text(), Some("/w==".to_string()));
    }
}
