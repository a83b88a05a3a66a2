//! Comment sync engine
//!
//! Owns the in-memory view of an open project's threads and reconciles the
//! local store with the remote comments collection.
//!
//! ## Pass
//!
//! 1. Read local tombstones; end quietly if the remote is not ready
//! 2. Pull remote records since the watermark, plus every remote tombstone
//! 3. Push local tombstones the remote lacks, then pull again if any were pushed
//! 4. Advance the watermark from the server clock
//! 5. Apply remote tombstones locally
//! 6. Materialize unknown remote threads (relocated against the current file)
//!    and comments; accept remote edits newer than ours by more than a second
//! 7. Push threads and comments the remote is missing or holds older copies of
//!
//! Conflicts resolve last-writer-wins per comment; concurrent edits are not
//! merged.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::coalesce::Coalescer;
use super::{SyncContext, SyncError};
use crate::anchor::Anchor;
use crate::models::{now_secs, Comment, Thread};
use crate::remote::{CommentRecord, RemoteRecord, ThreadRecord, Tombstone, TombstoneTarget};
use crate::storage::StorageError;
use crate::workspace::Notification;

/// A remote edit must be newer than the local copy by more than this to win
const UPDATE_SLACK_SECS: f64 = 1.0;

/// Pass behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Pull everything on every pass instead of changes since the last one.
    /// Peers with skewed clocks miss each other's edits otherwise.
    pub full_resync: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { full_resync: true }
    }
}

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub threads_added: usize,
    pub comments_added: usize,
    pub comments_updated: usize,
    pub tombstones_applied: usize,
    pub threads_pushed: usize,
    pub comments_pushed: usize,
    pub tombstones_pushed: usize,
}

impl SyncReport {
    /// Whether the pass changed nothing on either side
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A live thread as currently displayed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveThread {
    pub id: Uuid,
    pub file_path: String,
    /// Zero-based line the thread points at in the current file content
    pub line: usize,
    pub anchor: Anchor,
    pub comments: Vec<Comment>,
}

/// Sync engine for threads and comments of one project
pub struct CommentSync {
    ctx: SyncContext,
    options: SyncOptions,
    threads: Mutex<HashMap<Uuid, LiveThread>>,
    watermark: Mutex<f64>,
    server_clock: Mutex<Option<f64>>,
    coalescer: Coalescer,
    disposed: AtomicBool,
}

impl CommentSync {
    pub fn new(ctx: SyncContext) -> Self {
        Self::with_options(ctx, SyncOptions::default())
    }

    pub fn with_options(ctx: SyncContext, options: SyncOptions) -> Self {
        Self {
            ctx,
            options,
            threads: Mutex::new(HashMap::new()),
            watermark: Mutex::new(0.0),
            server_clock: Mutex::new(None),
            coalescer: Coalescer::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Timestamp the next pass pulls from
    pub async fn watermark(&self) -> f64 {
        *self.watermark.lock().await
    }

    /// Server time seen by the last pass
    pub async fn server_clock(&self) -> Option<f64> {
        *self.server_clock.lock().await
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stop the engine; later operations fail with [`SyncError::Disposed`]
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.threads.lock().await.clear();
        debug!("Comment sync disposed");
    }

    fn check_disposed(&self) -> Result<(), SyncError> {
        if self.is_disposed() {
            Err(SyncError::Disposed)
        } else {
            Ok(())
        }
    }

    // ==================== View ====================

    /// Load live threads from the local store
    pub async fn load(&self) -> Result<usize, SyncError> {
        self.check_disposed()?;
        let active = self.ctx.local.lock().await.list_active()?;

        let mut threads = self.threads.lock().await;
        threads.clear();
        for entry in active {
            let live = self.live(entry.thread, entry.comments);
            threads.insert(live.id, live);
        }
        debug!("Loaded {} thread(s)", threads.len());
        Ok(threads.len())
    }

    /// Live threads ordered by file and line
    pub async fn threads(&self) -> Vec<LiveThread> {
        let mut threads: Vec<LiveThread> = self.threads.lock().await.values().cloned().collect();
        threads.sort_by(|a, b| a.file_path.cmp(&b.file_path).then(a.line.cmp(&b.line)));
        threads
    }

    /// One live thread
    pub async fn thread(&self, id: &Uuid) -> Option<LiveThread> {
        self.threads.lock().await.get(id).cloned()
    }

    fn locate(&self, thread: &Thread) -> usize {
        match self
            .ctx
            .workspace
            .read_document(Path::new(&thread.file_path))
        {
            Some(document) => thread.anchor.relocate(&document),
            None => thread.anchor.line,
        }
    }

    fn live(&self, thread: Thread, comments: Vec<Comment>) -> LiveThread {
        let line = self.locate(&thread);
        LiveThread {
            id: thread.id,
            file_path: thread.file_path,
            line,
            anchor: thread.anchor,
            comments,
        }
    }

    async fn update_view_comment(&self, comment: &Comment) -> Result<(), SyncError> {
        let mut threads = self.threads.lock().await;
        self.check_disposed()?;
        if let Some(live) = threads.get_mut(&comment.thread_id) {
            match live.comments.iter_mut().find(|c| c.id == comment.id) {
                Some(existing) => *existing = comment.clone(),
                None => live.comments.push(comment.clone()),
            }
        }
        Ok(())
    }

    // ==================== Local changes ====================

    /// Server time when the remote is ready, local time otherwise
    async fn timestamp(&self) -> f64 {
        if let Some(remote) = self.ctx.ready_remote() {
            match remote.server_time().await {
                Ok(now) => return now,
                Err(e) => warn!("Using local clock, server time unavailable: {}", e),
            }
        }
        now_secs()
    }

    async fn sync_after_change(&self) {
        if self.ctx.ready_remote().is_none() {
            return;
        }
        if let Err(e) = self.request_sync().await {
            warn!("Sync after local change failed: {}", e);
        }
    }

    /// Start a thread at `line` of `path` with a first comment
    pub async fn create_thread(&self, path: &Path, line: usize, body: &str) -> Result<Uuid, SyncError> {
        self.check_disposed()?;
        let document = self
            .ctx
            .workspace
            .read_document(path)
            .ok_or_else(|| SyncError::Unreadable(path.to_path_buf()))?;

        let anchor = Anchor::capture(&document, line, self.ctx.anchor_lines);
        let thread = Thread::new(anchor, path.to_string_lossy());
        let mut comment = Comment::new(thread.id, body, self.ctx.author.clone());
        let at = self.timestamp().await;
        comment.created = at;
        comment.last_modified = at;

        {
            let local = self.ctx.local.lock().await;
            local.upsert_thread(&thread)?;
            local.upsert_comment(&comment)?;
        }

        let id = thread.id;
        let live = self.live(thread, vec![comment]);
        debug!("Created thread {} at {:?}:{}", id, path, live.line);
        {
            let mut threads = self.threads.lock().await;
            self.check_disposed()?;
            threads.insert(id, live);
        }

        self.sync_after_change().await;
        Ok(id)
    }

    /// Add a comment to a live thread
    pub async fn reply(&self, thread_id: &Uuid, body: &str) -> Result<Uuid, SyncError> {
        self.check_disposed()?;
        let mut comment = Comment::new(*thread_id, body, self.ctx.author.clone());
        let at = self.timestamp().await;
        comment.created = at;
        comment.last_modified = at;

        self.ctx.local.lock().await.upsert_comment(&comment)?;
        self.update_view_comment(&comment).await?;

        self.sync_after_change().await;
        Ok(comment.id)
    }

    /// Replace the text of a comment
    pub async fn edit_comment(&self, comment_id: &Uuid, body: &str) -> Result<(), SyncError> {
        self.check_disposed()?;
        let at = self.timestamp().await;

        let comment = {
            let local = self.ctx.local.lock().await;
            let mut comment = local
                .comment(comment_id)?
                .filter(|c| !c.deleted)
                .ok_or_else(|| StorageError::missing("comment", comment_id))?;
            comment.body = body.to_string();
            comment.last_modified = at;
            local.upsert_comment(&comment)?;
            comment
        };
        self.update_view_comment(&comment).await?;

        self.sync_after_change().await;
        Ok(())
    }

    /// Delete a comment; deleting the last one deletes its thread
    pub async fn delete_comment(&self, comment_id: &Uuid) -> Result<(), SyncError> {
        self.check_disposed()?;
        let at = self.timestamp().await;

        let (thread_id, emptied) = {
            let local = self.ctx.local.lock().await;
            let comment = local
                .comment(comment_id)?
                .filter(|c| !c.deleted)
                .ok_or_else(|| StorageError::missing("comment", comment_id))?;
            local.tombstone_comment(comment_id, at)?;

            let emptied = local.comment_ids_for_thread(&comment.thread_id)?.is_empty();
            if emptied {
                local.tombstone_thread(&comment.thread_id, at)?;
            }
            (comment.thread_id, emptied)
        };

        {
            let mut threads = self.threads.lock().await;
            if emptied {
                threads.remove(&thread_id);
            } else if let Some(live) = threads.get_mut(&thread_id) {
                live.comments.retain(|c| c.id != *comment_id);
            }
        }

        self.sync_after_change().await;
        Ok(())
    }

    /// Delete a thread and its comments
    pub async fn delete_thread(&self, thread_id: &Uuid) -> Result<(), SyncError> {
        self.check_disposed()?;
        let at = self.timestamp().await;

        let removed = self.ctx.local.lock().await.tombstone_thread(thread_id, at)?;
        if !removed {
            return Err(StorageError::missing("thread", thread_id).into());
        }
        self.threads.lock().await.remove(thread_id);

        self.sync_after_change().await;
        Ok(())
    }

    /// Delete every thread of the project
    pub async fn delete_all(&self) -> Result<usize, SyncError> {
        self.check_disposed()?;
        let at = self.timestamp().await;

        let count = {
            let local = self.ctx.local.lock().await;
            let active = local.list_active()?;
            for entry in &active {
                local.tombstone_thread(&entry.thread.id, at)?;
            }
            active.len()
        };
        self.threads.lock().await.clear();

        self.sync_after_change().await;
        Ok(count)
    }

    /// Move a thread to `line` of its file, returning the line it landed on
    pub async fn reanchor(&self, thread_id: &Uuid, line: usize) -> Result<usize, SyncError> {
        self.check_disposed()?;
        let mut thread = self
            .ctx
            .local
            .lock()
            .await
            .thread(thread_id)?
            .filter(|t| !t.deleted)
            .ok_or_else(|| StorageError::missing("thread", thread_id))?;

        let path = Path::new(&thread.file_path).to_path_buf();
        let document = self
            .ctx
            .workspace
            .read_document(&path)
            .ok_or(SyncError::Unreadable(path))?;
        thread.anchor = Anchor::capture(&document, line, self.ctx.anchor_lines);
        let landed = thread.anchor.line;

        self.ctx.local.lock().await.upsert_thread(&thread)?;
        {
            let mut threads = self.threads.lock().await;
            self.check_disposed()?;
            if let Some(live) = threads.get_mut(thread_id) {
                live.anchor = thread.anchor.clone();
                live.line = landed;
            }
        }

        if let Some(remote) = self.ctx.ready_remote().cloned() {
            let at = self.timestamp().await;
            remote.push(&self.thread_record(&thread, at)).await?;
        }
        Ok(landed)
    }

    fn thread_record(&self, thread: &Thread, timestamp: f64) -> RemoteRecord {
        RemoteRecord::Thread(ThreadRecord {
            id: thread.id,
            file_path: self.ctx.workspace.relative(Path::new(&thread.file_path)),
            anchor: thread.anchor.clone(),
            timestamp,
        })
    }

    // ==================== Sync ====================

    /// Run a sync pass, or queue one behind the pass in progress
    ///
    /// Returns `None` when the request was queued.
    pub async fn request_sync(&self) -> Result<Option<SyncReport>, SyncError> {
        self.check_disposed()?;
        self.coalescer.run(|| self.pass()).await.transpose()
    }

    async fn pass(&self) -> Result<SyncReport, SyncError> {
        self.check_disposed()?;
        let mut report = SyncReport::default();

        let local_tombstones = self.ctx.local.lock().await.list_all_tombstoned()?;

        let Some(remote) = self.ctx.ready_remote().cloned() else {
            debug!("Remote store not ready, skipping comment sync");
            return Ok(report);
        };

        let since = *self.watermark.lock().await;
        self.check_disposed()?;
        let mut pull = remote.pull_comments_since(since).await?;

        // Local deletions the remote has not seen yet
        let known: HashSet<(TombstoneTarget, Uuid)> =
            pull.tombstones.iter().map(|t| (t.target, t.id)).collect();
        let unseen: Vec<Tombstone> = local_tombstones
            .threads
            .iter()
            .map(|id| Tombstone::thread(*id))
            .chain(
                local_tombstones
                    .comments
                    .iter()
                    .map(|(cid, tid)| Tombstone::comment(*cid, *tid)),
            )
            .filter(|t| !known.contains(&(t.target, t.id)))
            .collect();
        for tombstone in &unseen {
            self.check_disposed()?;
            remote.push(&RemoteRecord::Tombstone(*tombstone)).await?;
        }
        report.tombstones_pushed = unseen.len();
        if !unseen.is_empty() {
            self.check_disposed()?;
            pull = remote.pull_comments_since(since).await?;
        }

        self.check_disposed()?;
        let server_now = remote.server_time().await?;
        *self.server_clock.lock().await = Some(server_now);
        *self.watermark.lock().await = if self.options.full_resync {
            0.0
        } else {
            server_now
        };

        // Remote deletions
        self.check_disposed()?;
        let dead_threads: HashSet<Uuid> = pull
            .tombstones
            .iter()
            .filter(|t| t.target == TombstoneTarget::Thread)
            .map(|t| t.id)
            .collect();
        let dead_comments: Vec<Uuid> = pull
            .tombstones
            .iter()
            .filter(|t| t.target == TombstoneTarget::Comment)
            .map(|t| t.id)
            .collect();
        {
            let local = self.ctx.local.lock().await;
            for id in &dead_threads {
                if local.tombstone_thread(id, server_now)? {
                    report.tombstones_applied += 1;
                }
            }
            report.tombstones_applied += local.tombstone_comments(&dead_comments, server_now)?;
        }
        {
            let mut threads = self.threads.lock().await;
            self.check_disposed()?;
            threads.retain(|id, _| !dead_threads.contains(id));
            for live in threads.values_mut() {
                live.comments.retain(|c| !dead_comments.contains(&c.id));
            }
        }

        // Remote creates and edits
        let gone_threads: HashSet<Uuid> = local_tombstones
            .threads
            .iter()
            .copied()
            .chain(dead_threads.iter().copied())
            .collect();
        let gone_comments: HashSet<Uuid> = local_tombstones
            .comments
            .iter()
            .map(|(cid, _)| *cid)
            .chain(dead_comments.iter().copied())
            .collect();

        let mut remote_threads: HashSet<Uuid> = HashSet::new();
        let mut remote_comments: HashMap<Uuid, f64> = HashMap::new();
        let mut thread_records = Vec::new();
        let mut comment_records = Vec::new();
        for record in pull.records {
            match record {
                RemoteRecord::Thread(t) => {
                    remote_threads.insert(t.id);
                    thread_records.push(t);
                }
                RemoteRecord::Comment(c) => {
                    remote_comments.insert(c.id, c.timestamp);
                    comment_records.push(c);
                }
                other => debug!("Ignoring {:?} in comment pull", other),
            }
        }

        for record in thread_records {
            if gone_threads.contains(&record.id) {
                continue;
            }
            self.check_disposed()?;
            self.apply_remote_thread(record, &mut report).await?;
        }
        for record in comment_records {
            if gone_comments.contains(&record.id) || gone_threads.contains(&record.thread_id) {
                debug!("Skipping remote comment {} of a deleted thread", record.id);
                continue;
            }
            self.check_disposed()?;
            self.apply_remote_comment(record, &mut report).await?;
        }

        // Local changes the remote lacks
        self.check_disposed()?;
        let active = self.ctx.local.lock().await.list_active()?;
        let mut outgoing = Vec::new();
        for entry in active {
            let comments: Vec<Comment> = entry
                .comments
                .into_iter()
                .filter(|c| match remote_comments.get(&c.id) {
                    None => true,
                    Some(remote_ts) => *remote_ts < c.last_modified,
                })
                .filter(|c| self.options.full_resync || c.last_modified > since)
                .collect();

            let missing = !remote_threads.contains(&entry.thread.id);
            if missing && (self.options.full_resync || !comments.is_empty()) {
                let thread = self.recapture(entry.thread).await?;
                outgoing.push(self.thread_record(&thread, server_now));
                report.threads_pushed += 1;
            }

            report.comments_pushed += comments.len();
            outgoing.extend(comments.into_iter().map(|c| {
                RemoteRecord::Comment(CommentRecord {
                    id: c.id,
                    thread_id: c.thread_id,
                    body: c.body,
                    author: c.author,
                    timestamp: c.last_modified,
                })
            }));
        }
        for record in &outgoing {
            self.check_disposed()?;
            remote.push(record).await?;
        }

        if report.is_empty() {
            debug!("Comment sync: nothing to do");
        } else {
            info!("Comment sync: {:?}", report);
        }
        Ok(report)
    }

    async fn apply_remote_thread(
        &self,
        record: ThreadRecord,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let thread = {
            let local = self.ctx.local.lock().await;
            if local.thread(&record.id)?.is_some() {
                return Ok(());
            }
            let path = self.ctx.workspace.absolute(&record.file_path);
            let thread = Thread {
                id: record.id,
                anchor: record.anchor,
                file_path: path.to_string_lossy().into_owned(),
                deleted: false,
            };
            local.upsert_thread(&thread)?;
            thread
        };

        let live = self.live(thread, Vec::new());
        debug!("Materialized thread {} at line {}", live.id, live.line);
        let mut threads = self.threads.lock().await;
        self.check_disposed()?;
        self.ctx.notifier.notify(Notification::ThreadAdded {
            thread_id: live.id,
            file_path: record.file_path,
            line: live.line,
        });
        threads.insert(live.id, live);
        report.threads_added += 1;
        Ok(())
    }

    async fn apply_remote_comment(
        &self,
        record: CommentRecord,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let change = {
            let local = self.ctx.local.lock().await;
            let thread_live = local
                .thread(&record.thread_id)?
                .map_or(false, |t| !t.deleted);
            if !thread_live {
                let message = format!(
                    "comment {} references unknown thread {}",
                    record.id, record.thread_id
                );
                error!("{}", message);
                return Err(SyncError::InvariantViolation(message));
            }

            match local.comment(&record.id)? {
                None => {
                    let comment = Comment {
                        id: record.id,
                        thread_id: record.thread_id,
                        body: record.body,
                        author: record.author,
                        last_modified: record.timestamp,
                        created: record.timestamp,
                        deleted: false,
                    };
                    local.upsert_comment(&comment)?;
                    Some((comment, true))
                }
                Some(existing) if existing.deleted => None,
                Some(mut existing)
                    if record.timestamp > existing.last_modified + UPDATE_SLACK_SECS =>
                {
                    existing.body = record.body;
                    existing.last_modified = record.timestamp;
                    local.upsert_comment(&existing)?;
                    Some((existing, false))
                }
                Some(_) => None,
            }
        };

        let Some((comment, added)) = change else {
            return Ok(());
        };
        self.update_view_comment(&comment).await?;
        self.check_disposed()?;
        if added {
            report.comments_added += 1;
            self.ctx.notifier.notify(Notification::CommentAdded {
                thread_id: comment.thread_id,
                comment_id: comment.id,
                author: comment.author,
                body: comment.body,
            });
        } else {
            report.comments_updated += 1;
            self.ctx.notifier.notify(Notification::CommentUpdated {
                thread_id: comment.thread_id,
                comment_id: comment.id,
                body: comment.body,
            });
        }
        Ok(())
    }

    /// Refresh a thread's anchor from the current file content
    async fn recapture(&self, mut thread: Thread) -> Result<Thread, SyncError> {
        let Some(document) = self
            .ctx
            .workspace
            .read_document(Path::new(&thread.file_path))
        else {
            debug!("Cannot read {}, pushing stored anchor", thread.file_path);
            return Ok(thread);
        };

        let line = thread.anchor.relocate(&document);
        thread.anchor = Anchor::capture(&document, line, self.ctx.anchor_lines);
        self.ctx.local.lock().await.upsert_thread(&thread)?;

        let mut threads = self.threads.lock().await;
        self.check_disposed()?;
        if let Some(live) = threads.get_mut(&thread.id) {
            live.anchor = thread.anchor.clone();
            live.line = thread.anchor.line;
        }
        Ok(thread)
    }
}
