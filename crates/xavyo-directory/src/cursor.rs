//! Resumable paged entry cursor
//!
//! [`EntryCursor`] streams one directory query as [`DirectoryEntry`] values.
//! It is an explicit state machine over (session, page cookie, processed
//! rows): pages are pulled with the continuation cookie, duplicate ids are
//! merged, and a transient communication failure reopens the session,
//! re-requests the current page and replays already processed rows as no-ops
//! until the last processed row is passed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::entry::{DirectoryEntry, RawEntry};
use crate::error::{DirectoryError, DirectoryResult};
use crate::session::{DirectorySession, PageCookie, SearchRequest, SessionProvider};

/// A finite, non-restartable sequence of directory entries.
#[async_trait]
pub trait EntrySource: Send {
    /// Next entry, or `None` once the sequence is exhausted.
    async fn next_entry(&mut self) -> DirectoryResult<Option<DirectoryEntry>>;

    /// Estimated total number of entries, when known up front.
    fn estimated_size(&self) -> Option<usize> {
        None
    }
}

/// Converts one raw row into an entry.
///
/// Returning `Ok(None)` skips the row. The session is handed in for point
/// lookups such as member resolution or range retrieval.
#[async_trait]
pub trait RowMapper: Send + Sync {
    async fn map_row(
        &self,
        session: &mut dyn DirectorySession,
        row: RawEntry,
    ) -> DirectoryResult<Option<DirectoryEntry>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    /// No page requested yet.
    Fresh,
    /// More pages are available after the buffered one.
    Paging,
    /// The buffered page is the last one.
    LastPage,
    /// Exhausted or failed.
    Finished,
}

enum Step {
    Emit(DirectoryEntry),
    Continue,
    Done,
}

/// Paged, resumable cursor over one query.
pub struct EntryCursor {
    label: &'static str,
    provider: Arc<dyn SessionProvider>,
    mapper: Arc<dyn RowMapper>,
    request: SearchRequest,
    session: Option<Box<dyn DirectorySession>>,
    state: CursorState,
    buffer: VecDeque<RawEntry>,
    /// Cookie that requested the buffered page.
    page_cookie: Option<PageCookie>,
    next_cookie: Option<PageCookie>,
    processed_rows: HashSet<String>,
    last_processed: Option<String>,
    /// Row name at which replay after a resume ends.
    replay_until: Option<String>,
    progress_since_resume: bool,
    resumed: bool,
    emitted_ids: HashSet<String>,
    expected_counts: HashMap<String, usize>,
    pending: HashMap<String, (DirectoryEntry, usize)>,
    pending_order: Vec<String>,
    leftovers: VecDeque<DirectoryEntry>,
    estimated_size: Option<usize>,
    pages_fetched: usize,
}

impl std::fmt::Debug for EntryCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryCursor")
            .field("label", &self.label)
            .field("request", &self.request)
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .field("processed", &self.processed_rows.len())
            .field("pages_fetched", &self.pages_fetched)
            .finish()
    }
}

impl EntryCursor {
    pub fn new(
        label: &'static str,
        provider: Arc<dyn SessionProvider>,
        mapper: Arc<dyn RowMapper>,
        request: SearchRequest,
    ) -> Self {
        Self {
            label,
            provider,
            mapper,
            request,
            session: None,
            state: CursorState::Fresh,
            buffer: VecDeque::new(),
            page_cookie: None,
            next_cookie: None,
            processed_rows: HashSet::new(),
            last_processed: None,
            replay_until: None,
            progress_since_resume: false,
            resumed: false,
            emitted_ids: HashSet::new(),
            expected_counts: HashMap::new(),
            pending: HashMap::new(),
            pending_order: Vec::new(),
            leftovers: VecDeque::new(),
            estimated_size: None,
            pages_fetched: 0,
        }
    }

    /// Expected occurrence counts of ids returned more than once.
    ///
    /// Rows of such an id are withheld and merged until the expected count is
    /// reached. Ids still pending when the query ends are emitted as merged so
    /// far.
    #[must_use]
    pub fn with_duplicate_counts(mut self, counts: HashMap<String, usize>) -> Self {
        self.expected_counts = counts.into_iter().filter(|(_, n)| *n > 1).collect();
        self
    }

    #[must_use]
    pub fn with_estimated_size(mut self, size: Option<usize>) -> Self {
        self.estimated_size = size;
        self
    }

    /// Number of page requests issued, including re-requests after a resume.
    #[must_use]
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    async fn step(&mut self) -> DirectoryResult<Step> {
        if self.state == CursorState::Finished {
            return Ok(Step::Done);
        }

        let Some(row) = self.buffer.pop_front() else {
            return match self.state {
                CursorState::Fresh | CursorState::Paging => {
                    self.fetch_page().await?;
                    Ok(Step::Continue)
                }
                _ => Ok(Step::Done),
            };
        };

        match self.process_row(row).await? {
            Some(entry) => Ok(Step::Emit(entry)),
            None => Ok(Step::Continue),
        }
    }

    async fn ensure_session(&mut self) -> DirectoryResult<&mut Box<dyn DirectorySession>> {
        if self.session.is_none() {
            self.session = Some(self.provider.open().await?);
        }
        self.session
            .as_mut()
            .ok_or_else(|| DirectoryError::internal("directory session not available"))
    }

    async fn fetch_page(&mut self) -> DirectoryResult<()> {
        let cookie = match self.state {
            CursorState::Fresh => None,
            _ => self.next_cookie.clone(),
        };
        let request = self.request.clone();
        let session = self.ensure_session().await?;
        let page = session.search_page(&request, cookie.as_ref()).await?;

        self.pages_fetched += 1;
        debug!(
            query = self.label,
            page = self.pages_fetched,
            rows = page.entries.len(),
            "Fetched result page"
        );
        self.install_page(cookie, page.entries, page.cookie);
        Ok(())
    }

    fn install_page(
        &mut self,
        cookie: Option<PageCookie>,
        entries: Vec<RawEntry>,
        next: Option<PageCookie>,
    ) {
        self.page_cookie = cookie;
        self.buffer = entries.into();
        self.next_cookie = next.filter(|c| !c.is_empty());
        self.state = if self.next_cookie.is_some() {
            CursorState::Paging
        } else {
            CursorState::LastPage
        };
    }

    async fn process_row(&mut self, row: RawEntry) -> DirectoryResult<Option<DirectoryEntry>> {
        let row_name = row.dn.clone();

        if let Some(until) = self.replay_until.clone() {
            if self.processed_rows.contains(&row_name) {
                debug!(query = self.label, row = %row_name, "Skipping already processed row after resume");
                if until == row_name {
                    self.replay_until = None;
                }
                return Ok(None);
            }
            info!(query = self.label, row = %row_name, "Reached unprocessed row during replay");
            self.replay_until = None;
        }

        let mapper = Arc::clone(&self.mapper);
        let session = self
            .session
            .as_deref_mut()
            .ok_or_else(|| DirectoryError::internal("directory session not available"))?;
        let mapped = mapper.map_row(session, row).await?;

        self.processed_rows.insert(row_name.clone());
        self.last_processed = Some(row_name);
        self.progress_since_resume = true;

        Ok(mapped.and_then(|entry| self.accept(entry)))
    }

    fn accept(&mut self, entry: DirectoryEntry) -> Option<DirectoryEntry> {
        let id = entry.id().to_string();
        let expected = self.expected_counts.get(&id).copied().unwrap_or(1);

        if expected <= 1 || self.emitted_ids.contains(&id) {
            if !self.emitted_ids.insert(id.clone()) {
                warn!(
                    query = self.label,
                    id = %id,
                    "Duplicate id found, emitting another entry for it"
                );
            }
            debug!(query = self.label, id = %id, "Adding entry");
            return Some(entry);
        }

        let seen = match self.pending.get_mut(&id) {
            Some((merged, seen)) => {
                merged.merge(entry);
                *seen += 1;
                *seen
            }
            None => {
                self.pending.insert(id.clone(), (entry, 1));
                self.pending_order.push(id.clone());
                1
            }
        };

        if seen < expected {
            debug!(query = self.label, id = %id, seen, expected, "Withholding duplicate for merge");
            return None;
        }

        self.pending_order.retain(|pending| pending != &id);
        let (merged, _) = self.pending.remove(&id)?;
        self.emitted_ids.insert(id.clone());
        debug!(query = self.label, id = %id, "Adding merged entry");
        Some(merged)
    }

    fn drain_pending(&mut self) {
        for id in std::mem::take(&mut self.pending_order) {
            if let Some((merged, seen)) = self.pending.remove(&id) {
                warn!(
                    query = self.label,
                    id = %id,
                    seen,
                    expected = self.expected_counts.get(&id).copied().unwrap_or(1),
                    "Fewer duplicate rows than counted, emitting partial merge"
                );
                self.emitted_ids.insert(id);
                self.leftovers.push_back(merged);
            }
        }
    }

    async fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                debug!(query = self.label, error = %e, "Error when closing directory session");
            }
        }
    }

    async fn finish(&mut self) {
        self.close_session().await;
        self.drain_pending();
        self.state = CursorState::Finished;
        info!(
            query = self.label,
            emitted = self.emitted_ids.len(),
            pages = self.pages_fetched,
            "Query completed"
        );
    }

    /// Reopen the session and re-request the current page.
    async fn resume(&mut self, cause: DirectoryError) -> DirectoryResult<()> {
        if self.resumed && !self.progress_since_resume {
            return Err(DirectoryError::resume_failed(cause));
        }

        warn!(
            query = self.label,
            error = %cause,
            last_processed = ?self.last_processed,
            "Communication failure, reconnecting to resume query"
        );

        self.close_session().await;
        self.buffer.clear();

        let cookie = match self.state {
            CursorState::Fresh => None,
            _ => self.page_cookie.clone(),
        };
        let request = self.request.clone();

        let mut session = self
            .provider
            .open()
            .await
            .map_err(DirectoryError::resume_failed)?;
        let page = match session.search_page(&request, cookie.as_ref()).await {
            Ok(page) => page,
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    debug!(query = self.label, error = %close_err, "Error when closing directory session");
                }
                return Err(DirectoryError::resume_failed(e));
            }
        };

        self.session = Some(session);
        self.pages_fetched += 1;
        self.install_page(cookie, page.entries, page.cookie);
        self.replay_until = self.last_processed.clone();
        self.progress_since_resume = false;
        self.resumed = true;
        Ok(())
    }
}

#[async_trait]
impl EntrySource for EntryCursor {
    async fn next_entry(&mut self) -> DirectoryResult<Option<DirectoryEntry>> {
        loop {
            if self.state == CursorState::Finished {
                return Ok(self.leftovers.pop_front());
            }

            match self.step().await {
                Ok(Step::Emit(entry)) => return Ok(Some(entry)),
                Ok(Step::Continue) => {}
                Ok(Step::Done) => self.finish().await,
                Err(e) if e.is_transient() => {
                    if let Err(resume_err) = self.resume(e).await {
                        self.close_session().await;
                        self.state = CursorState::Finished;
                        self.leftovers.clear();
                        return Err(resume_err);
                    }
                }
                Err(e) => {
                    self.close_session().await;
                    self.state = CursorState::Finished;
                    self.leftovers.clear();
                    return Err(e);
                }
            }
        }
    }

    fn estimated_size(&self) -> Option<usize> {
        self.estimated_size
    }
}

/// Collect all remaining entries of a source.
pub async fn collect_entries(source: &mut dyn EntrySource) -> DirectoryResult<Vec<DirectoryEntry>> {
    let mut entries = Vec::with_capacity(source.estimated_size().unwrap_or(0));
    while let Some(entry) = source.next_entry().await? {
        entries.push(entry);
    }
    Ok(entries)
}
