//! User registries
//!
//! A [`UserRegistry`] is one directory source as seen by the synchronizer:
//! changed groups and persons as entry cursors, id-only name listings, and a
//! capability set. [`LdapUserRegistry`] implements it on top of a
//! [`SessionProvider`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::config::LdapRegistryConfig;
use crate::cursor::{EntryCursor, EntrySource, RowMapper};
use crate::dn::{escape_filter_value, DistinguishedName};
use crate::entry::{props, DirectoryEntry, PropertyValue, RawEntry, GROUP_PREFIX};
use crate::error::{DirectoryError, DirectoryResult};
use crate::interpreter::UserAccountInterpreter;
use crate::mapper::MapperRegistry;
use crate::session::{for_each_entry, DirectorySession, SearchRequest, SessionProvider};

static RANGE_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r";range=[0-9]+-\*").expect("RANGE_END is a valid regex pattern")
});

/// Tenants a tenant-aware registry serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantScope {
    All,
    Only(BTreeSet<String>),
}

impl TenantScope {
    #[must_use]
    pub fn is_active_for(&self, tenant: &str) -> bool {
        match self {
            TenantScope::All => true,
            TenantScope::Only(tenants) => tenants.contains(tenant),
        }
    }
}

/// Optional capabilities of a registry, checked by presence.
#[derive(Debug, Clone, Default)]
pub struct RegistryCapabilities {
    /// Interprets the account status property of persons.
    pub account_interpreter: Option<Arc<dyn UserAccountInterpreter>>,
    /// Present when the registry decides activation per tenant.
    pub tenant_scope: Option<TenantScope>,
}

/// One directory source.
#[async_trait]
pub trait UserRegistry: Send + Sync {
    /// Activation flag for registries that are not tenant-aware.
    fn is_active(&self) -> bool;

    fn capabilities(&self) -> RegistryCapabilities;

    /// Groups modified after `modified_since`, or all groups.
    async fn groups(
        &self,
        modified_since: Option<DateTime<Utc>>,
    ) -> DirectoryResult<Box<dyn EntrySource>>;

    /// Persons modified after `modified_since`, or all persons.
    async fn persons(
        &self,
        modified_since: Option<DateTime<Utc>>,
    ) -> DirectoryResult<Box<dyn EntrySource>>;

    /// Authority names (`GROUP_`-prefixed) of all groups.
    async fn group_names(&self) -> DirectoryResult<Vec<String>>;

    /// User names of all persons.
    async fn person_names(&self) -> DirectoryResult<Vec<String>>;

    /// Person property keys this registry maps.
    fn person_mapped_properties(&self) -> BTreeSet<String>;
}

#[derive(Debug)]
struct RegistryInner {
    config: LdapRegistryConfig,
    mappers: MapperRegistry,
    group_base: DistinguishedName,
    user_base: DistinguishedName,
    disjoint: bool,
}

impl RegistryInner {
    /// First mapped text value of an attribute.
    fn mapped_text(&self, row: &RawEntry, attribute: &str) -> Option<String> {
        let (name, values) = row.attribute(attribute)?;
        self.mappers
            .map_text(name, values)
            .into_iter()
            .find(|v| !v.is_empty())
    }

    fn missing_id(&self, dn: &str, attribute: &str, strict: bool) -> DirectoryResult<Option<String>> {
        if strict {
            return Err(DirectoryError::MissingIdAttribute {
                dn: dn.to_string(),
                attribute: attribute.to_string(),
            });
        }
        warn!(dn = %dn, attribute = %attribute, "Entry missing id attribute, skipping");
        Ok(None)
    }

    fn row_id(&self, row: &RawEntry, attribute: &str, strict: bool) -> DirectoryResult<Option<String>> {
        match self.mapped_text(row, attribute) {
            Some(id) => Ok(Some(id)),
            None => self.missing_id(&row.dn, attribute, strict),
        }
    }

    fn map_to_entry(
        &self,
        row: &RawEntry,
        id_attribute: &str,
        strict: bool,
        mapping: &std::collections::BTreeMap<String, String>,
        defaults: &std::collections::BTreeMap<String, String>,
    ) -> DirectoryResult<Option<DirectoryEntry>> {
        let Some(id) = self.row_id(row, id_attribute, strict)? else {
            return Ok(None);
        };
        let mut entry = DirectoryEntry::new(row.dn.clone(), id);

        if let Some(raw) = row.first_text(&self.config.modify_timestamp_attribute) {
            entry.set_last_modified(Some(self.config.parse_timestamp(raw)?));
        }

        let properties = entry.properties_mut();
        for (key, attribute) in mapping {
            let mapped = row
                .attribute(attribute)
                .map(|(name, values)| self.mappers.map_all(name, values))
                .unwrap_or_default();
            let value = match mapped.len() {
                0 => defaults
                    .get(key)
                    .map_or(PropertyValue::Null, |d| PropertyValue::String(d.clone())),
                1 => mapped.into_iter().next().unwrap_or(PropertyValue::Null),
                _ => PropertyValue::Array(mapped),
            };
            properties.insert(key.clone(), value);
        }
        for (key, default) in defaults {
            if !mapping.contains_key(key) {
                properties.insert(key.clone(), PropertyValue::String(default.clone()));
            }
        }

        Ok(Some(entry))
    }

    async fn lookup_member(
        &self,
        session: &mut dyn DirectorySession,
        group: &str,
        member: &str,
    ) -> DirectoryResult<Option<String>> {
        let attributes = vec![
            "objectclass".to_string(),
            self.config.group_id_attribute.clone(),
            self.config.user_id_attribute.clone(),
        ];

        let child = match session.read_entry(member, &attributes).await {
            Ok(child) => child,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => return self.unresolvable(group, member, Some(e)),
        };
        let Some(child) = child else {
            return self.unresolvable(group, member, None);
        };

        let object_classes = child
            .attribute("objectclass")
            .map(|(name, values)| self.mappers.map_text(name, values))
            .unwrap_or_default();
        let has_class = |class: &str| object_classes.iter().any(|c| c.eq_ignore_ascii_case(class));

        if has_class(&self.config.person_type) {
            return match self.mapped_text(&child, &self.config.user_id_attribute) {
                Some(person) => {
                    debug!(member = %person, "User DN recognized by directory lookup");
                    Ok(Some(person))
                }
                None => self.missing_id(
                    member,
                    &self.config.user_id_attribute,
                    self.config.error_on_missing_uid,
                ),
            };
        }

        if has_class(&self.config.group_type) {
            return match self.mapped_text(&child, &self.config.group_id_attribute) {
                Some(gid) => {
                    debug!(member = %gid, "Group DN recognized by directory lookup");
                    Ok(Some(format!("{GROUP_PREFIX}{gid}")))
                }
                None => self.missing_id(
                    member,
                    &self.config.group_id_attribute,
                    self.config.error_on_missing_gid,
                ),
            };
        }

        self.unresolvable(group, member, None)
    }

    fn unresolvable(
        &self,
        group: &str,
        member: &str,
        cause: Option<DirectoryError>,
    ) -> DirectoryResult<Option<String>> {
        if self.config.error_on_missing_members {
            return Err(DirectoryError::UnresolvableMember {
                group: group.to_string(),
                member: member.to_string(),
                source: cause.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
            });
        }
        match cause {
            Some(e) => warn!(group = %group, member = %member, error = %e, "Failed to resolve member of group"),
            None => warn!(group = %group, member = %member, "Failed to resolve member of group"),
        }
        Ok(None)
    }

    async fn resolve_member(
        &self,
        session: &mut dyn DirectorySession,
        group: &str,
        member: &str,
    ) -> DirectoryResult<Option<String>> {
        let dn = match DistinguishedName::parse(member) {
            Ok(dn) if !dn.is_empty() => dn,
            _ => {
                debug!(member = %member, "Member recognized as flat name");
                return Ok(Some(member.to_string()));
            }
        };

        let under_users = dn.is_under(&self.user_base);
        let under_groups = dn.is_under(&self.group_base);

        if self.disjoint {
            if let Some(rdn) = dn.leftmost() {
                if under_users {
                    if let Some(person) = rdn.value_of(&self.config.user_id_attribute) {
                        debug!(member = %person, "User DN recognized");
                        return Ok(Some(person.to_string()));
                    }
                }
                if under_groups {
                    if let Some(gid) = rdn.value_of(&self.config.group_id_attribute) {
                        debug!(member = %gid, "Group DN recognized");
                        return Ok(Some(format!("{GROUP_PREFIX}{gid}")));
                    }
                }
            }
        }

        if under_users || under_groups {
            return self.lookup_member(session, group, member).await;
        }

        self.unresolvable(group, member, None)
    }

    async fn group_children(
        &self,
        session: &mut dyn DirectorySession,
        row: &RawEntry,
        group: &str,
    ) -> DirectoryResult<BTreeSet<String>> {
        debug!(group = %group, dn = %row.dn, "Processing group members");

        let member_attribute = &self.config.member_attribute;
        let batch = self.config.attribute_batch_size as usize;
        let mut children = BTreeSet::new();
        let mut current = row
            .range_attribute(member_attribute)
            .map(|(name, values)| (name.to_string(), values));
        let mut next_start = batch;

        while let Some((name, values)) = current.take() {
            for member in self.mappers.map_text(&name, values) {
                if member.is_empty() {
                    continue;
                }
                if let Some(child) = self.resolve_member(session, group, &member).await? {
                    children.insert(child);
                }
            }

            if next_start > 0 && !RANGE_END.is_match(&name.to_ascii_lowercase()) {
                let range = format!(
                    "{member_attribute};range={next_start}-{}",
                    next_start + batch - 1
                );
                current = session
                    .read_entry(&row.dn, &[range])
                    .await?
                    .and_then(|next| {
                        next.range_attribute(member_attribute)
                            .map(|(name, values)| (name.to_string(), values))
                    });
                next_start += batch;
            }
        }

        Ok(children)
    }
}

struct PersonRowMapper {
    inner: Arc<RegistryInner>,
}

#[async_trait]
impl RowMapper for PersonRowMapper {
    async fn map_row(
        &self,
        _session: &mut dyn DirectorySession,
        row: RawEntry,
    ) -> DirectoryResult<Option<DirectoryEntry>> {
        let config = &self.inner.config;
        self.inner.map_to_entry(
            &row,
            &config.user_id_attribute,
            config.error_on_missing_uid,
            &config.effective_person_mapping(),
            &config.person_attribute_defaults,
        )
    }
}

struct GroupRowMapper {
    inner: Arc<RegistryInner>,
}

#[async_trait]
impl RowMapper for GroupRowMapper {
    async fn map_row(
        &self,
        session: &mut dyn DirectorySession,
        row: RawEntry,
    ) -> DirectoryResult<Option<DirectoryEntry>> {
        let config = &self.inner.config;
        let Some(mut entry) = self.inner.map_to_entry(
            &row,
            &config.group_id_attribute,
            config.error_on_missing_gid,
            &config.effective_group_mapping(),
            &config.group_attribute_defaults,
        )?
        else {
            return Ok(None);
        };

        let authority = format!("{GROUP_PREFIX}{}", entry.id());
        entry
            .properties_mut()
            .insert(props::AUTHORITY_NAME.to_string(), PropertyValue::String(authority.clone()));

        let children = self
            .inner
            .group_children(session, &row, &authority)
            .await?;
        entry.children_mut().extend(children);
        Ok(Some(entry))
    }
}

/// LDAP-backed user registry.
pub struct LdapUserRegistry {
    inner: Arc<RegistryInner>,
    provider: Arc<dyn SessionProvider>,
    account_interpreter: Option<Arc<dyn UserAccountInterpreter>>,
    tenant_scope: Option<TenantScope>,
}

impl fmt::Debug for LdapUserRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LdapUserRegistry")
            .field("config", &self.inner.config)
            .field("disjoint", &self.inner.disjoint)
            .field("account_interpreter", &self.account_interpreter)
            .field("tenant_scope", &self.tenant_scope)
            .finish()
    }
}

impl LdapUserRegistry {
    /// Create a registry; validates the configuration and search bases.
    pub fn new(
        config: LdapRegistryConfig,
        provider: Arc<dyn SessionProvider>,
    ) -> DirectoryResult<Self> {
        config.validate()?;

        let parse_base = |base: &str| {
            DistinguishedName::parse(&base.to_lowercase()).map_err(|e| {
                DirectoryError::invalid_configuration(format!("invalid search base '{base}': {e}"))
            })
        };
        let group_base = parse_base(&config.group_search_base)?;
        let user_base = parse_base(&config.user_search_base)?;
        let disjoint = group_base.is_disjoint_from(&user_base);

        Ok(Self {
            inner: Arc::new(RegistryInner {
                config,
                mappers: MapperRegistry::new(),
                group_base,
                user_base,
                disjoint,
            }),
            provider,
            account_interpreter: None,
            tenant_scope: None,
        })
    }

    /// Use the given attribute value mappers.
    #[must_use]
    pub fn with_mappers(mut self, mappers: MapperRegistry) -> Self {
        let inner = &self.inner;
        self.inner = Arc::new(RegistryInner {
            config: inner.config.clone(),
            mappers,
            group_base: inner.group_base.clone(),
            user_base: inner.user_base.clone(),
            disjoint: inner.disjoint,
        });
        self
    }

    #[must_use]
    pub fn with_account_interpreter(mut self, interpreter: Arc<dyn UserAccountInterpreter>) -> Self {
        self.account_interpreter = Some(interpreter);
        self
    }

    /// Make the registry tenant-aware.
    #[must_use]
    pub fn with_tenant_scope(mut self, scope: TenantScope) -> Self {
        self.tenant_scope = Some(scope);
        self
    }

    #[must_use]
    pub fn config(&self) -> &LdapRegistryConfig {
        &self.inner.config
    }

    /// Whether the user and group search bases are disjoint subtrees.
    #[must_use]
    pub fn bases_disjoint(&self) -> bool {
        self.inner.disjoint
    }

    /// Resolve the DN of a user by id.
    ///
    /// The id is escaped into the filter and the returned id attribute must
    /// match case-insensitively.
    #[instrument(skip(self))]
    pub async fn resolve_distinguished_name(&self, user_id: &str) -> DirectoryResult<Option<String>> {
        let config = &self.inner.config;
        let filter = format!(
            "(&{}({}={}))",
            config.person_query,
            config.user_id_attribute,
            escape_filter_value(user_id)
        );
        let request = SearchRequest::new(&config.user_search_base, filter)
            .with_attributes([config.user_id_attribute.clone()]);

        let mut rows = Vec::new();
        for_each_entry(self.provider.as_ref(), &request, |row| {
            rows.push(row);
            Ok(())
        })
        .await?;

        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        match self.inner.mapped_text(&row, &config.user_id_attribute) {
            Some(uid) if uid.to_lowercase() == user_id.to_lowercase() => Ok(Some(row.dn)),
            Some(_) => Ok(None),
            None => self
                .inner
                .missing_id(&row.dn, &config.user_id_attribute, config.error_on_missing_uid)
                .map(|_| None),
        }
    }

    async fn count(&self, base: &str, filter: String) -> DirectoryResult<usize> {
        let request = SearchRequest::new(base, filter)
            .with_attributes([self.inner.config.modify_timestamp_attribute.clone()])
            .with_page_size(self.inner.config.query_batch_size);
        let mut count = 0usize;
        for_each_entry(self.provider.as_ref(), &request, |_| {
            count += 1;
            Ok(())
        })
        .await?;
        Ok(count)
    }

    /// Count group id occurrences of a query; fails on duplicates in strict mode.
    async fn count_group_ids(&self, filter: &str) -> DirectoryResult<HashMap<String, usize>> {
        let config = &self.inner.config;
        let request = SearchRequest::new(&config.group_search_base, filter)
            .with_attributes([config.group_id_attribute.clone()])
            .with_page_size(config.query_batch_size);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for_each_entry(self.provider.as_ref(), &request, |row| {
            let Some(gid) = self.inner.row_id(&row, &config.group_id_attribute, config.error_on_missing_gid)? else {
                return Ok(());
            };
            debug!(group = %gid, "Group DN recognized");
            let seen = counts.entry(gid.clone()).or_insert(0);
            *seen += 1;
            if *seen > 1 {
                if config.error_on_duplicate_gid {
                    return Err(DirectoryError::DuplicateId { kind: "group", id: gid });
                }
                warn!(group = %gid, "Duplicate gid found, merging definitions");
            }
            Ok(())
        })
        .await?;
        Ok(counts)
    }

    async fn list_ids(
        &self,
        base: &str,
        filter: &str,
        attribute: &str,
        strict: bool,
    ) -> DirectoryResult<Vec<String>> {
        let request = SearchRequest::new(base, filter)
            .with_attributes([attribute.to_string()])
            .with_page_size(self.inner.config.query_batch_size);
        let mut ids = Vec::new();
        for_each_entry(self.provider.as_ref(), &request, |row| {
            if let Some(id) = self.inner.row_id(&row, attribute, strict)? {
                ids.push(id);
            }
            Ok(())
        })
        .await?;
        Ok(ids)
    }
}

#[async_trait]
impl UserRegistry for LdapUserRegistry {
    fn is_active(&self) -> bool {
        self.inner.config.active
    }

    fn capabilities(&self) -> RegistryCapabilities {
        RegistryCapabilities {
            account_interpreter: self.account_interpreter.clone(),
            tenant_scope: self.tenant_scope.clone(),
        }
    }

    #[instrument(skip(self))]
    async fn groups(
        &self,
        modified_since: Option<DateTime<Utc>>,
    ) -> DirectoryResult<Box<dyn EntrySource>> {
        let config = &self.inner.config;
        let filter = config.group_filter(modified_since);

        let counts = self.count_group_ids(&filter).await?;
        let estimated = counts.len();

        let request = SearchRequest::new(&config.group_search_base, filter)
            .with_attributes(config.group_attributes())
            .with_page_size(config.query_batch_size);
        let mapper = Arc::new(GroupRowMapper {
            inner: Arc::clone(&self.inner),
        });

        Ok(Box::new(
            EntryCursor::new("groups", Arc::clone(&self.provider), mapper, request)
                .with_duplicate_counts(counts)
                .with_estimated_size(Some(estimated)),
        ))
    }

    #[instrument(skip(self))]
    async fn persons(
        &self,
        modified_since: Option<DateTime<Utc>>,
    ) -> DirectoryResult<Box<dyn EntrySource>> {
        let config = &self.inner.config;
        let filter = config.person_filter(modified_since);

        let estimated = if config.enable_progress_estimation {
            Some(self.count(&config.user_search_base, filter.clone()).await?)
        } else {
            None
        };

        let request = SearchRequest::new(&config.user_search_base, filter)
            .with_attributes(config.person_attributes())
            .with_page_size(config.query_batch_size);
        let mapper = Arc::new(PersonRowMapper {
            inner: Arc::clone(&self.inner),
        });

        Ok(Box::new(
            EntryCursor::new("persons", Arc::clone(&self.provider), mapper, request)
                .with_estimated_size(estimated),
        ))
    }

    async fn group_names(&self) -> DirectoryResult<Vec<String>> {
        let config = &self.inner.config;
        let ids = self
            .list_ids(
                &config.group_search_base,
                &config.group_query,
                &config.group_id_attribute,
                config.error_on_missing_gid,
            )
            .await?;
        Ok(ids
            .into_iter()
            .map(|gid| format!("{GROUP_PREFIX}{gid}"))
            .collect())
    }

    async fn person_names(&self) -> DirectoryResult<Vec<String>> {
        let config = &self.inner.config;
        self.list_ids(
            &config.user_search_base,
            &config.person_query,
            &config.user_id_attribute,
            config.error_on_missing_uid,
        )
        .await
    }

    fn person_mapped_properties(&self) -> BTreeSet<String> {
        self.inner
            .config
            .effective_person_mapping()
            .into_keys()
            .collect()
    }
}
