//! Directory session abstraction
//!
//! A session is one authenticated connection to a directory source. It yields
//! pages of raw rows for a filter and reports continuation through an opaque
//! cookie. The [`ldap`](crate::ldap) module adapts `ldap3` to this contract;
//! [`memory`](crate::memory) provides a scripted implementation.

use std::fmt;

use async_trait::async_trait;

use crate::entry::RawEntry;
use crate::error::DirectoryResult;

/// Opaque paged-results continuation cookie.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PageCookie(Vec<u8>);

impl PageCookie {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// An empty cookie from the server means the result set is exhausted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for PageCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageCookie({} bytes)", self.0.len())
    }
}

/// A subtree search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: String,
    pub filter: String,
    pub attributes: Vec<String>,
    /// Page size; 0 disables paging and returns everything in one page.
    pub page_size: u32,
}

impl SearchRequest {
    pub fn new(base: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            filter: filter.into(),
            attributes: Vec::new(),
            page_size: 0,
        }
    }

    #[must_use]
    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }
}

/// One page of search results.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub entries: Vec<RawEntry>,
    /// Cookie for the next page; `None` when this was the last page.
    pub cookie: Option<PageCookie>,
}

/// An open directory session.
#[async_trait]
pub trait DirectorySession: Send {
    /// Fetch one page of `request`, continuing from `cookie` if given.
    async fn search_page(
        &mut self,
        request: &SearchRequest,
        cookie: Option<&PageCookie>,
    ) -> DirectoryResult<SearchPage>;

    /// Read selected attributes of a single entry. `None` if it does not exist.
    async fn read_entry(
        &mut self,
        dn: &str,
        attributes: &[String],
    ) -> DirectoryResult<Option<RawEntry>>;

    /// Close the session. Errors are logged by callers, never propagated.
    async fn close(&mut self) -> DirectoryResult<()>;
}

/// Opens sessions against one directory source.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open(&self) -> DirectoryResult<Box<dyn DirectorySession>>;
}

/// Run `request` to completion, calling `visit` for every row.
///
/// Used for the id-only and counting queries that need no resume support.
pub async fn for_each_entry<F>(
    provider: &dyn SessionProvider,
    request: &SearchRequest,
    mut visit: F,
) -> DirectoryResult<()>
where
    F: FnMut(RawEntry) -> DirectoryResult<()> + Send,
{
    tracing::debug!(
        base = %request.base,
        filter = %request.filter,
        attributes = ?request.attributes,
        page_size = request.page_size,
        "Processing query"
    );

    let mut session = provider.open().await?;
    let result = async {
        let mut cookie: Option<PageCookie> = None;
        loop {
            let page = session.search_page(request, cookie.as_ref()).await?;
            for entry in page.entries {
                visit(entry)?;
            }
            match page.cookie {
                Some(next) if !next.is_empty() => cookie = Some(next),
                _ => return Ok(()),
            }
        }
    }
    .await;

    if let Err(e) = session.close().await {
        tracing::debug!(error = %e, "Error when closing directory session");
    }
    result
}
