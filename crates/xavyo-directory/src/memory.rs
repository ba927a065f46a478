//! In-memory directory
//!
//! A scripted [`SessionProvider`] for tests and local runs: entries live in
//! insertion order, searches honour base, filter, attribute selection, paging
//! and `;range=` retrieval, and faults can be injected per call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::cursor::EntrySource;
use crate::dn::DistinguishedName;
use crate::entry::{DirectoryEntry, RawEntry};
use crate::error::{DirectoryError, DirectoryResult};
use crate::session::{DirectorySession, PageCookie, SearchPage, SearchRequest, SessionProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Transient,
    Permanent,
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<RawEntry>,
    range_cap: Option<usize>,
    search_faults: HashMap<usize, Fault>,
    read_faults: HashSet<usize>,
    open_faults: HashSet<usize>,
    search_log: Vec<String>,
    read_calls: usize,
    open_attempts: usize,
    opened: usize,
    closed: usize,
}

/// Shared, cloneable in-memory directory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDirectory {
    state: Arc<Mutex<State>>,
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, replacing any entry with the same name.
    pub fn add_entry(&self, entry: RawEntry) {
        let mut state = self.state.lock();
        match state
            .entries
            .iter_mut()
            .find(|existing| existing.dn.eq_ignore_ascii_case(&entry.dn))
        {
            Some(existing) => *existing = entry,
            None => state.entries.push(entry),
        }
    }

    /// Remove an entry by name.
    pub fn remove_entry(&self, dn: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|e| !e.dn.eq_ignore_ascii_case(dn));
        state.entries.len() != before
    }

    /// Server-imposed cap on values returned per multi-valued attribute.
    pub fn set_range_cap(&self, cap: usize) {
        self.state.lock().range_cap = Some(cap);
    }

    /// Make the `n`-th search call (1-based) fail with a communication error.
    pub fn fail_search_call(&self, n: usize) {
        self.state.lock().search_faults.insert(n, Fault::Transient);
    }

    /// Make the `n`-th search call (1-based) fail with a permanent error.
    pub fn fail_search_permanently(&self, n: usize) {
        self.state.lock().search_faults.insert(n, Fault::Permanent);
    }

    /// Make the `n`-th entry read (1-based) fail with a communication error.
    pub fn fail_read_call(&self, n: usize) {
        self.state.lock().read_faults.insert(n);
    }

    /// Make the `n`-th session open (1-based) fail.
    pub fn fail_open(&self, n: usize) {
        self.state.lock().open_faults.insert(n);
    }

    #[must_use]
    pub fn search_calls(&self) -> usize {
        self.state.lock().search_log.len()
    }

    /// Filters of all search calls in order.
    #[must_use]
    pub fn search_log(&self) -> Vec<String> {
        self.state.lock().search_log.clone()
    }

    #[must_use]
    pub fn read_calls(&self) -> usize {
        self.state.lock().read_calls
    }

    #[must_use]
    pub fn sessions_opened(&self) -> usize {
        self.state.lock().opened
    }

    /// Sessions opened and not yet closed.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        let state = self.state.lock();
        state.opened - state.closed
    }
}

#[async_trait]
impl SessionProvider for InMemoryDirectory {
    async fn open(&self) -> DirectoryResult<Box<dyn DirectorySession>> {
        let mut state = self.state.lock();
        state.open_attempts += 1;
        let attempt = state.open_attempts;
        if state.open_faults.remove(&attempt) {
            return Err(DirectoryError::connection_failed("connection refused"));
        }
        state.opened += 1;
        Ok(Box::new(InMemorySession {
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

struct InMemorySession {
    state: Arc<Mutex<State>>,
    closed: bool,
}

#[async_trait]
impl DirectorySession for InMemorySession {
    async fn search_page(
        &mut self,
        request: &SearchRequest,
        cookie: Option<&PageCookie>,
    ) -> DirectoryResult<SearchPage> {
        if self.closed {
            return Err(DirectoryError::communication("session closed"));
        }
        let mut state = self.state.lock();
        state.search_log.push(request.filter.clone());
        let call = state.search_log.len();
        match state.search_faults.remove(&call) {
            Some(Fault::Transient) => {
                return Err(DirectoryError::communication("connection reset by peer"))
            }
            Some(Fault::Permanent) => {
                return Err(DirectoryError::search_failed("unwilling to perform"))
            }
            None => {}
        }

        let filter = Filter::parse(&request.filter)?;
        let base = DistinguishedName::parse(&request.base)?;
        let matching: Vec<&RawEntry> = state
            .entries
            .iter()
            .filter(|entry| {
                DistinguishedName::parse(&entry.dn).is_ok_and(|dn| dn.is_under(&base))
                    && filter.matches(entry)
            })
            .collect();

        let offset = match cookie {
            Some(c) => std::str::from_utf8(c.as_bytes())
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| DirectoryError::search_failed("invalid paged results cookie"))?,
            None => 0,
        };
        let end = if request.page_size == 0 {
            matching.len()
        } else {
            (offset + request.page_size as usize).min(matching.len())
        };
        let start = offset.min(end);

        let entries = matching[start..end]
            .iter()
            .map(|entry| project(entry, &request.attributes, state.range_cap))
            .collect();
        let cookie = (end < matching.len()).then(|| PageCookie::new(end.to_string().into_bytes()));

        Ok(SearchPage { entries, cookie })
    }

    async fn read_entry(
        &mut self,
        dn: &str,
        attributes: &[String],
    ) -> DirectoryResult<Option<RawEntry>> {
        if self.closed {
            return Err(DirectoryError::communication("session closed"));
        }
        let mut state = self.state.lock();
        state.read_calls += 1;
        let call = state.read_calls;
        if state.read_faults.remove(&call) {
            return Err(DirectoryError::communication("connection reset by peer"));
        }

        let target = DistinguishedName::parse(dn)?;
        Ok(state
            .entries
            .iter()
            .find(|entry| {
                DistinguishedName::parse(&entry.dn)
                    .is_ok_and(|candidate| candidate.is_under(&target) && target.is_under(&candidate))
            })
            .map(|entry| project(entry, attributes, state.range_cap)))
    }

    async fn close(&mut self) -> DirectoryResult<()> {
        if !self.closed {
            self.closed = true;
            self.state.lock().closed += 1;
        }
        Ok(())
    }
}

fn project(entry: &RawEntry, attributes: &[String], range_cap: Option<usize>) -> RawEntry {
    let mut projected = RawEntry::new(entry.dn.clone());

    let wanted: Vec<(String, Option<(usize, Option<usize>)>)> = if attributes.is_empty() {
        entry
            .attrs
            .keys()
            .chain(entry.bin_attrs.keys())
            .map(|name| (name.clone(), None))
            .collect()
    } else {
        attributes.iter().map(|a| parse_range(a)).collect()
    };

    for (name, range) in wanted {
        if let Some((stored, values)) = entry
            .attrs
            .iter()
            .find(|(attr, _)| attr.eq_ignore_ascii_case(&name))
        {
            let (lo, hi) = match (range, range_cap) {
                (Some((lo, hi)), _) => (lo, hi),
                (None, Some(cap)) if values.len() > cap => (0, Some(cap - 1)),
                (None, _) => {
                    projected.attrs.insert(stored.clone(), values.clone());
                    continue;
                }
            };
            if lo >= values.len() {
                continue;
            }
            let last = values.len() - 1;
            let hi = hi.map_or(last, |h| h.min(last));
            let hi = match range_cap {
                Some(cap) => hi.min(lo + cap - 1),
                None => hi,
            };
            let label = if hi == last {
                format!("{stored};range={lo}-*")
            } else {
                format!("{stored};range={lo}-{hi}")
            };
            projected.attrs.insert(label, values[lo..=hi].to_vec());
        } else if let Some((stored, values)) = entry
            .bin_attrs
            .iter()
            .find(|(attr, _)| attr.eq_ignore_ascii_case(&name))
        {
            projected.bin_attrs.insert(stored.clone(), values.clone());
        }
    }

    projected
}

/// Split `member;range=0-99` into the attribute name and range bounds.
fn parse_range(attribute: &str) -> (String, Option<(usize, Option<usize>)>) {
    let Some((name, options)) = attribute.split_once(';') else {
        return (attribute.to_string(), None);
    };
    let range = options
        .strip_prefix("range=")
        .and_then(|r| r.split_once('-'))
        .and_then(|(lo, hi)| {
            let lo = lo.parse::<usize>().ok()?;
            let hi = if hi == "*" { None } else { Some(hi.parse::<usize>().ok()?) };
            Some((lo, hi))
        });
    (name.to_string(), range)
}

/// Minimal RFC 4515 filter evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Equal(String, String),
    Substring(String, Vec<String>),
    LessOrEqual(String, String),
    GreaterOrEqual(String, String),
}

impl Filter {
    fn parse(filter: &str) -> DirectoryResult<Self> {
        let chars: Vec<char> = filter.trim().chars().collect();
        let mut pos = 0;
        let parsed = Self::parse_at(&chars, &mut pos)
            .map_err(|m| DirectoryError::search_failed(format!("bad filter '{filter}': {m}")))?;
        if pos != chars.len() {
            return Err(DirectoryError::search_failed(format!(
                "bad filter '{filter}': trailing characters"
            )));
        }
        Ok(parsed)
    }

    fn parse_at(chars: &[char], pos: &mut usize) -> Result<Self, String> {
        if chars.get(*pos) != Some(&'(') {
            return Err(format!("expected '(' at {pos}"));
        }
        *pos += 1;
        let filter = match chars.get(*pos) {
            Some('&') | Some('|') => {
                let and = chars[*pos] == '&';
                *pos += 1;
                let mut parts = Vec::new();
                while chars.get(*pos) == Some(&'(') {
                    parts.push(Self::parse_at(chars, pos)?);
                }
                if and {
                    Filter::And(parts)
                } else {
                    Filter::Or(parts)
                }
            }
            Some('!') => {
                *pos += 1;
                Filter::Not(Box::new(Self::parse_at(chars, pos)?))
            }
            Some(_) => Self::parse_item(chars, pos)?,
            None => return Err("unexpected end".to_string()),
        };
        if chars.get(*pos) != Some(&')') {
            return Err(format!("expected ')' at {pos}"));
        }
        *pos += 1;
        Ok(filter)
    }

    fn parse_item(chars: &[char], pos: &mut usize) -> Result<Self, String> {
        let start = *pos;
        while let Some(c) = chars.get(*pos) {
            if matches!(c, '=' | '<' | '>' | '~' | ')') {
                break;
            }
            *pos += 1;
        }
        let attribute: String = chars[start..*pos].iter().collect();
        let op: String = match (chars.get(*pos), chars.get(*pos + 1)) {
            (Some('='), _) => "=".to_string(),
            (Some(c @ ('<' | '>' | '~')), Some('=')) => format!("{c}="),
            _ => return Err(format!("expected operator at {pos}")),
        };
        *pos += op.len();

        let value_start = *pos;
        while let Some(c) = chars.get(*pos) {
            if *c == ')' {
                break;
            }
            *pos += 1;
        }
        let raw: String = chars[value_start..*pos].iter().collect();

        Ok(match op.as_str() {
            "<=" => Filter::LessOrEqual(attribute, unescape(&raw)?),
            ">=" => Filter::GreaterOrEqual(attribute, unescape(&raw)?),
            _ if raw == "*" => Filter::Present(attribute),
            _ if raw.contains('*') => Filter::Substring(
                attribute,
                raw.split('*').map(unescape).collect::<Result<_, _>>()?,
            ),
            _ => Filter::Equal(attribute, unescape(&raw)?),
        })
    }

    fn matches(&self, entry: &RawEntry) -> bool {
        let values = |attribute: &str| -> Vec<String> {
            entry
                .attrs
                .iter()
                .filter(|(name, _)| name.eq_ignore_ascii_case(attribute))
                .flat_map(|(_, values)| values.iter().map(|v| v.to_lowercase()))
                .collect()
        };

        match self {
            Filter::And(parts) => parts.iter().all(|f| f.matches(entry)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(entry)),
            Filter::Not(inner) => !inner.matches(entry),
            Filter::Present(attribute) => {
                attribute.eq_ignore_ascii_case("objectclass")
                    || entry.attribute(attribute).is_some()
            }
            Filter::Equal(attribute, value) => {
                let value = value.to_lowercase();
                values(attribute).iter().any(|v| *v == value)
            }
            Filter::LessOrEqual(attribute, value) => {
                let value = value.to_lowercase();
                values(attribute).iter().any(|v| *v <= value)
            }
            Filter::GreaterOrEqual(attribute, value) => {
                let value = value.to_lowercase();
                values(attribute).iter().any(|v| *v >= value)
            }
            Filter::Substring(attribute, segments) => values(attribute)
                .iter()
                .any(|v| substring_match(v, segments)),
        }
    }
}

fn substring_match(value: &str, segments: &[String]) -> bool {
    let segments: Vec<String> = segments.iter().map(|s| s.to_lowercase()).collect();
    let Some((first, rest)) = segments.split_first() else {
        return true;
    };
    let Some(mut remaining) = value.strip_prefix(first.as_str()) else {
        return false;
    };
    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };
    for segment in middle {
        match remaining.find(segment.as_str()) {
            Some(i) => remaining = &remaining[i + segment.len()..],
            None => return false,
        }
    }
    remaining.ends_with(last.as_str())
}

fn unescape(raw: &str) -> Result<String, String> {
    let mut bytes = Vec::with_capacity(raw.len());
    let raw = raw.as_bytes();
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' {
            let hex = raw
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| "invalid escape".to_string())?;
            bytes.push(hex);
            i += 3;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

/// Entry source over a fixed list of entries.
#[derive(Debug, Clone, Default)]
pub struct StaticEntrySource {
    entries: std::collections::VecDeque<DirectoryEntry>,
    estimated: Option<usize>,
}

impl StaticEntrySource {
    #[must_use]
    pub fn new(entries: Vec<DirectoryEntry>) -> Self {
        let estimated = Some(entries.len());
        Self {
            entries: entries.into(),
            estimated,
        }
    }
}

#[async_trait]
impl EntrySource for StaticEntrySource {
    async fn next_entry(&mut self) -> DirectoryResult<Option<DirectoryEntry>> {
        Ok(self.entries.pop_front())
    }

    fn estimated_size(&self) -> Option<usize> {
        self.estimated
    }
}

/// Render a timestamp the way the default directory format stores it.
#[must_use]
pub fn directory_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y%m%d%H%M%SZ").to_string()
}
