//! In-memory collaborators.
//!
//! Reference implementations of the identity store, checkpoint store and
//! lock service. Tests use them to observe exactly what a run changed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use xavyo_directory::{props, AuthorityKind, PropertyMap, PropertyValue};

use crate::checkpoint::{CheckpointStore, CheckpointValue};
use crate::error::{LockError, LockResult, StoreError, StoreResult};
use crate::lock::{LockService, LockToken};
use crate::store::{IdentityStore, StoreTransaction};

#[derive(Debug, Clone)]
struct Authority {
    name: String,
    display_name: String,
    zones: BTreeSet<String>,
    /// Member keys.
    children: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
struct TenantState {
    authorities: BTreeMap<String, Authority>,
    persons: BTreeMap<String, PropertyMap>,
    avatars: BTreeMap<String, Vec<u8>>,
}

impl TenantState {
    fn name_of(&self, key: &str) -> String {
        self.authorities
            .get(key)
            .map_or_else(|| key.to_string(), |a| a.name.clone())
    }
}

/// A write recorded by a transaction and replayed on commit.
#[derive(Debug, Clone)]
enum Op {
    CreateAuthority(String, Authority),
    SetDisplayName(String, String),
    AddChild(String, String),
    RemoveChild(String, String),
    DeleteAuthority(String),
    AddZones(String, BTreeSet<String>),
    RemoveZones(String, BTreeSet<String>),
    CreatePerson(String, Authority, PropertyMap),
    SetProperties(String, PropertyMap),
    DeletePerson(String),
    SetAvatar(String, Vec<u8>),
}

impl Op {
    /// Apply to `state`; returns whether anything changed.
    fn apply(&self, state: &mut TenantState) -> bool {
        match self {
            Op::CreateAuthority(key, authority) => {
                if state.authorities.contains_key(key) {
                    return false;
                }
                state.authorities.insert(key.clone(), authority.clone());
                true
            }
            Op::SetDisplayName(key, display_name) => match state.authorities.get_mut(key) {
                Some(a) if &a.display_name != display_name => {
                    a.display_name = display_name.clone();
                    true
                }
                _ => false,
            },
            Op::AddChild(parent, child) => state
                .authorities
                .get_mut(parent)
                .is_some_and(|a| a.children.insert(child.clone())),
            Op::RemoveChild(parent, child) => state
                .authorities
                .get_mut(parent)
                .is_some_and(|a| a.children.remove(child)),
            Op::DeleteAuthority(key) => {
                let removed = state.authorities.remove(key).is_some();
                if removed {
                    for authority in state.authorities.values_mut() {
                        authority.children.remove(key);
                    }
                }
                removed
            }
            Op::AddZones(key, zones) => state.authorities.get_mut(key).is_some_and(|a| {
                let before = a.zones.len();
                a.zones.extend(zones.iter().cloned());
                a.zones.len() != before
            }),
            Op::RemoveZones(key, zones) => state.authorities.get_mut(key).is_some_and(|a| {
                let before = a.zones.len();
                a.zones.retain(|z| !zones.contains(z));
                a.zones.len() != before
            }),
            Op::CreatePerson(key, authority, properties) => {
                if state.persons.contains_key(key) {
                    return false;
                }
                state.authorities.insert(key.clone(), authority.clone());
                state.persons.insert(key.clone(), properties.clone());
                true
            }
            Op::SetProperties(key, properties) => {
                let Some(person) = state.persons.get_mut(key) else {
                    return false;
                };
                let mut changed = false;
                for (name, value) in properties {
                    if value.is_null() {
                        changed |= person.remove(name).is_some();
                    } else if person.get(name) != Some(value) {
                        person.insert(name.clone(), value.clone());
                        changed = true;
                    }
                }
                changed
            }
            Op::DeletePerson(key) => {
                let removed = state.persons.remove(key).is_some();
                state.avatars.remove(key);
                if state.authorities.remove(key).is_some() {
                    for authority in state.authorities.values_mut() {
                        authority.children.remove(key);
                    }
                }
                removed
            }
            Op::SetAvatar(key, content) => {
                if state.avatars.get(key) == Some(content) {
                    return false;
                }
                state.avatars.insert(key.clone(), content.clone());
                true
            }
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    tenants: HashMap<String, TenantState>,
    commits: usize,
    rollbacks: usize,
    mutations: usize,
    failing: HashSet<String>,
}

#[derive(Debug)]
struct StoreOptions {
    read_only: bool,
    case_sensitive: bool,
    creates_missing_people: bool,
}

/// Shared, cloneable in-memory identity store.
///
/// Transactions read a snapshot of their tenant, see their own writes, and
/// replay them on commit. Only writes that change state count as mutations.
#[derive(Debug, Clone)]
pub struct InMemoryIdentityStore {
    state: Arc<Mutex<StoreState>>,
    options: Arc<StoreOptions>,
}

impl Default for InMemoryIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIdentityStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            options: Arc::new(StoreOptions {
                read_only: false,
                case_sensitive: true,
                creates_missing_people: true,
            }),
        }
    }

    fn with_options(self, update: impl FnOnce(&mut StoreOptions)) -> Self {
        let mut options = StoreOptions {
            read_only: self.options.read_only,
            case_sensitive: self.options.case_sensitive,
            creates_missing_people: self.options.creates_missing_people,
        };
        update(&mut options);
        Self {
            state: self.state,
            options: Arc::new(options),
        }
    }

    #[must_use]
    pub fn read_only(self) -> Self {
        self.with_options(|o| o.read_only = true)
    }

    #[must_use]
    pub fn case_insensitive_users(self) -> Self {
        self.with_options(|o| o.case_sensitive = false)
    }

    #[must_use]
    pub fn without_missing_people_creation(self) -> Self {
        self.with_options(|o| o.creates_missing_people = false)
    }

    /// Make every write touching `name` fail.
    pub fn fail_writes_for(&self, name: &str) {
        let key = key_for(self.options.case_sensitive, name);
        self.state.lock().failing.insert(key);
    }

    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    /// Committed writes that changed state.
    pub fn mutations(&self) -> usize {
        self.state.lock().mutations
    }

    fn with_tenant<R>(&self, tenant: &str, f: impl FnOnce(&TenantState) -> R) -> R {
        let state = self.state.lock();
        match state.tenants.get(tenant) {
            Some(tenant) => f(tenant),
            None => f(&TenantState::default()),
        }
    }

    fn key(&self, name: &str) -> String {
        key_for(self.options.case_sensitive, name)
    }

    pub fn authority_names_in(&self, tenant: &str) -> Vec<String> {
        self.with_tenant(tenant, |t| t.authorities.values().map(|a| a.name.clone()).collect())
    }

    /// Names of all authorities, groups and users, of the default tenant.
    pub fn authority_names(&self) -> Vec<String> {
        self.authority_names_in("")
    }

    pub fn group_count(&self) -> usize {
        self.with_tenant("", |t| {
            t.authorities
                .keys()
                .filter(|k| AuthorityKind::of(k) == AuthorityKind::Group)
                .count()
        })
    }

    pub fn display_name(&self, name: &str) -> Option<String> {
        let key = self.key(name);
        self.with_tenant("", |t| t.authorities.get(&key).map(|a| a.display_name.clone()))
    }

    pub fn zones_in(&self, tenant: &str, name: &str) -> Option<BTreeSet<String>> {
        let key = self.key(name);
        self.with_tenant(tenant, |t| t.authorities.get(&key).map(|a| a.zones.clone()))
    }

    pub fn zones(&self, name: &str) -> Option<BTreeSet<String>> {
        self.zones_in("", name)
    }

    pub fn members_in(&self, tenant: &str, name: &str) -> BTreeSet<String> {
        let key = self.key(name);
        self.with_tenant(tenant, |t| {
            t.authorities
                .get(&key)
                .map(|a| a.children.iter().map(|c| t.name_of(c)).collect())
                .unwrap_or_default()
        })
    }

    /// Direct members of a group of the default tenant.
    pub fn members(&self, name: &str) -> BTreeSet<String> {
        self.members_in("", name)
    }

    pub fn person_in(&self, tenant: &str, user_name: &str) -> Option<PropertyMap> {
        let key = self.key(user_name);
        self.with_tenant(tenant, |t| t.persons.get(&key).cloned())
    }

    pub fn person(&self, user_name: &str) -> Option<PropertyMap> {
        self.person_in("", user_name)
    }

    pub fn person_count_in(&self, tenant: &str) -> usize {
        self.with_tenant(tenant, |t| t.persons.len())
    }

    pub fn avatar(&self, user_name: &str) -> Option<Vec<u8>> {
        let key = self.key(user_name);
        self.with_tenant("", |t| t.avatars.get(&key).cloned())
    }
}

fn key_for(case_sensitive: bool, name: &str) -> String {
    if case_sensitive || AuthorityKind::of(name) == AuthorityKind::Group {
        name.to_string()
    } else {
        name.to_lowercase()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    fn user_names_case_sensitive(&self) -> bool {
        self.options.case_sensitive
    }

    fn creates_missing_people(&self) -> bool {
        self.options.creates_missing_people
    }

    async fn begin(&self, tenant: &str) -> StoreResult<Box<dyn StoreTransaction>> {
        let (working, failing) = {
            let state = self.state.lock();
            (
                state.tenants.get(tenant).cloned().unwrap_or_default(),
                state.failing.clone(),
            )
        };
        Ok(Box::new(InMemoryTransaction {
            store: self.clone(),
            tenant: tenant.to_string(),
            working,
            failing,
            ops: Vec::new(),
        }))
    }
}

struct InMemoryTransaction {
    store: InMemoryIdentityStore,
    tenant: String,
    working: TenantState,
    failing: HashSet<String>,
    ops: Vec<Op>,
}

impl InMemoryTransaction {
    fn key(&self, name: &str) -> String {
        self.store.key(name)
    }

    fn write(&mut self, op: Op) -> StoreResult<()> {
        if self.store.options.read_only {
            return Err(StoreError::ReadOnly);
        }
        let touched = match &op {
            Op::CreateAuthority(key, _)
            | Op::SetDisplayName(key, _)
            | Op::DeleteAuthority(key)
            | Op::AddZones(key, _)
            | Op::RemoveZones(key, _)
            | Op::CreatePerson(key, _, _)
            | Op::SetProperties(key, _)
            | Op::DeletePerson(key)
            | Op::SetAvatar(key, _) => vec![key.as_str()],
            Op::AddChild(parent, child) | Op::RemoveChild(parent, child) => {
                vec![parent.as_str(), child.as_str()]
            }
        };
        if let Some(key) = touched.into_iter().find(|k| self.failing.contains(*k)) {
            return Err(StoreError::operation(format!("injected failure for {key}")));
        }
        op.apply(&mut self.working);
        self.ops.push(op);
        Ok(())
    }

    fn require(&self, key: &str, name: &str) -> StoreResult<()> {
        if self.working.authorities.contains_key(key) {
            Ok(())
        } else {
            Err(StoreError::not_found(name))
        }
    }

    fn walk(
        &self,
        start: &str,
        immediate: bool,
        next: impl Fn(&str) -> Vec<String>,
    ) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut pending = next(start);
        while let Some(key) = pending.pop() {
            if found.insert(key.clone()) && !immediate {
                pending.extend(next(&key));
            }
        }
        found
    }

    fn names(&self, keys: BTreeSet<String>, kind: Option<AuthorityKind>) -> BTreeSet<String> {
        keys.into_iter()
            .filter(|k| kind.map_or(true, |kind| AuthorityKind::of(k) == kind))
            .map(|k| self.working.name_of(&k))
            .collect()
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn authority_exists(&mut self, name: &str) -> StoreResult<bool> {
        Ok(self.working.authorities.contains_key(&self.key(name)))
    }

    async fn create_authority(
        &mut self,
        kind: AuthorityKind,
        short_name: &str,
        display_name: &str,
        zones: &BTreeSet<String>,
    ) -> StoreResult<String> {
        let name = kind.authority_name(short_name);
        let key = self.key(&name);
        if self.working.authorities.contains_key(&key) {
            return Err(StoreError::AlreadyExists { name });
        }
        let authority = Authority {
            name: name.clone(),
            display_name: display_name.to_string(),
            zones: zones.clone(),
            children: BTreeSet::new(),
        };
        self.write(Op::CreateAuthority(key, authority))?;
        Ok(name)
    }

    async fn set_authority_display_name(&mut self, name: &str, display_name: &str) -> StoreResult<()> {
        let key = self.key(name);
        self.require(&key, name)?;
        self.write(Op::SetDisplayName(key, display_name.to_string()))
    }

    async fn add_authority(&mut self, parent: &str, child: &str) -> StoreResult<()> {
        let (parent_key, child_key) = (self.key(parent), self.key(child));
        self.require(&parent_key, parent)?;
        self.require(&child_key, child)?;
        self.write(Op::AddChild(parent_key, child_key))
    }

    async fn remove_authority(&mut self, parent: &str, child: &str) -> StoreResult<()> {
        let (parent_key, child_key) = (self.key(parent), self.key(child));
        self.write(Op::RemoveChild(parent_key, child_key))
    }

    async fn delete_authority(&mut self, name: &str) -> StoreResult<()> {
        let key = self.key(name);
        self.write(Op::DeleteAuthority(key))
    }

    async fn authority_zones(&mut self, name: &str) -> StoreResult<Option<BTreeSet<String>>> {
        Ok(self
            .working
            .authorities
            .get(&self.key(name))
            .map(|a| a.zones.clone()))
    }

    async fn add_authority_to_zones(&mut self, name: &str, zones: &BTreeSet<String>) -> StoreResult<()> {
        let key = self.key(name);
        self.require(&key, name)?;
        self.write(Op::AddZones(key, zones.clone()))
    }

    async fn remove_authority_from_zones(
        &mut self,
        name: &str,
        zones: &BTreeSet<String>,
    ) -> StoreResult<()> {
        let key = self.key(name);
        self.require(&key, name)?;
        self.write(Op::RemoveZones(key, zones.clone()))
    }

    async fn contained_authorities(
        &mut self,
        kind: Option<AuthorityKind>,
        name: &str,
        immediate: bool,
    ) -> StoreResult<BTreeSet<String>> {
        let key = self.key(name);
        let authorities = &self.working.authorities;
        let found = self.walk(&key, immediate, |k| {
            authorities
                .get(k)
                .map(|a| a.children.iter().cloned().collect())
                .unwrap_or_default()
        });
        Ok(self.names(found, kind))
    }

    async fn containing_authorities(
        &mut self,
        kind: Option<AuthorityKind>,
        name: &str,
        immediate: bool,
    ) -> StoreResult<BTreeSet<String>> {
        let key = self.key(name);
        let authorities = &self.working.authorities;
        let found = self.walk(&key, immediate, |k| {
            authorities
                .iter()
                .filter(|(_, a)| a.children.contains(k))
                .map(|(parent, _)| parent.clone())
                .collect()
        });
        Ok(self.names(found, kind))
    }

    async fn authorities_in_zone(
        &mut self,
        kind: AuthorityKind,
        zone: &str,
    ) -> StoreResult<BTreeSet<String>> {
        Ok(self
            .working
            .authorities
            .iter()
            .filter(|(key, a)| AuthorityKind::of(key) == kind && a.zones.contains(zone))
            .map(|(_, a)| a.name.clone())
            .collect())
    }

    async fn person_exists(&mut self, user_name: &str) -> StoreResult<bool> {
        Ok(self.working.persons.contains_key(&self.key(user_name)))
    }

    async fn create_person(
        &mut self,
        properties: &PropertyMap,
        zones: &BTreeSet<String>,
    ) -> StoreResult<()> {
        let user_name = properties
            .get(props::USER_NAME)
            .and_then(|v| v.as_str())
            .ok_or_else(|| StoreError::operation("person has no userName"))?
            .to_string();
        let key = self.key(&user_name);
        if self.working.persons.contains_key(&key) {
            return Err(StoreError::AlreadyExists { name: user_name });
        }
        let stored: PropertyMap = properties
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let authority = Authority {
            name: user_name.clone(),
            display_name: user_name,
            zones: zones.clone(),
            children: BTreeSet::new(),
        };
        self.write(Op::CreatePerson(key, authority, stored))
    }

    async fn set_person_properties(
        &mut self,
        user_name: &str,
        properties: &PropertyMap,
    ) -> StoreResult<()> {
        let key = self.key(user_name);
        if !self.working.persons.contains_key(&key) {
            return Err(StoreError::not_found(user_name));
        }
        self.write(Op::SetProperties(key, properties.clone()))
    }

    async fn delete_person(&mut self, user_name: &str) -> StoreResult<()> {
        let key = self.key(user_name);
        self.write(Op::DeletePerson(key))
    }

    async fn get_person(&mut self, user_name: &str) -> StoreResult<Option<PropertyMap>> {
        Ok(self.working.persons.get(&self.key(user_name)).cloned())
    }

    async fn avatar(&mut self, user_name: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.working.avatars.get(&self.key(user_name)).cloned())
    }

    async fn set_avatar(&mut self, user_name: &str, content: &[u8]) -> StoreResult<()> {
        let key = self.key(user_name);
        if !self.working.persons.contains_key(&key) {
            return Err(StoreError::not_found(user_name));
        }
        self.write(Op::SetAvatar(key, content.to_vec()))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut state = self.store.state.lock();
        let tenant = state.tenants.entry(self.tenant.clone()).or_default();
        let mut changed = 0;
        for op in &self.ops {
            if op.apply(tenant) {
                changed += 1;
            }
        }
        state.mutations += changed;
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.store.state.lock().rollbacks += 1;
        Ok(())
    }
}

/// In-memory attribute store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    values: Arc<Mutex<BTreeMap<Vec<String>, CheckpointValue>>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every stored attribute.
    pub fn snapshot(&self) -> BTreeMap<Vec<String>, CheckpointValue> {
        self.values.lock().clone()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, key: &[String]) -> StoreResult<Option<CheckpointValue>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &[String], value: CheckpointValue) -> StoreResult<()> {
        self.values.lock().insert(key.to_vec(), value);
        Ok(())
    }

    async fn remove(&self, prefix: &[String]) -> StoreResult<()> {
        self.values.lock().retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Lease {
    id: uuid::Uuid,
    expires: Instant,
}

/// Single-process lock service with expiring leases.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockService {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl InMemoryLockService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `name` on behalf of another process.
    pub fn hold(&self, name: &str, ttl: Duration) -> LockToken {
        let token = LockToken::new(name);
        self.leases.lock().insert(
            name.to_string(),
            Lease {
                id: token.id,
                expires: Instant::now() + ttl,
            },
        );
        token
    }

    /// Drop `name` regardless of owner.
    pub fn revoke(&self, name: &str) {
        self.leases.lock().remove(name);
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.leases
            .lock()
            .get(name)
            .is_some_and(|lease| lease.expires > Instant::now())
    }

    fn try_take(&self, name: &str, ttl: Duration) -> Option<LockToken> {
        let mut leases = self.leases.lock();
        let now = Instant::now();
        if leases.get(name).is_some_and(|lease| lease.expires > now) {
            return None;
        }
        let token = LockToken::new(name);
        leases.insert(
            name.to_string(),
            Lease {
                id: token.id,
                expires: now + ttl,
            },
        );
        Some(token)
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        wait: Duration,
        retries: u32,
    ) -> LockResult<LockToken> {
        for attempt in 0..=retries {
            if let Some(token) = self.try_take(name, ttl) {
                return Ok(token);
            }
            if attempt < retries && !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
        Err(LockError::Unavailable {
            name: name.to_string(),
        })
    }

    async fn refresh(&self, token: &LockToken, ttl: Duration) -> LockResult<()> {
        let mut leases = self.leases.lock();
        let now = Instant::now();
        match leases.get_mut(&token.name) {
            Some(lease) if lease.id == token.id && lease.expires > now => {
                lease.expires = now + ttl;
                Ok(())
            }
            _ => Err(LockError::Lost {
                name: token.name.clone(),
            }),
        }
    }

    async fn release(&self, token: &LockToken) -> LockResult<()> {
        let mut leases = self.leases.lock();
        match leases.get(&token.name) {
            Some(lease) if lease.id != token.id => Err(LockError::Lost {
                name: token.name.clone(),
            }),
            _ => {
                leases.remove(&token.name);
                Ok(())
            }
        }
    }
}
