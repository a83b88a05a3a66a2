//! Finding sync engine
//!
//! Findings arrive in batches, one per analysis run. A pass compares the
//! average creation time of the local and remote batches: a side newer by more
//! than half a second replaces the other wholesale. Otherwise the batches are
//! merged by id and flags resolve last-writer-wins on `flag_timestamp`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::coalesce::Coalescer;
use super::{SyncContext, SyncError};
use crate::models::{now_secs, Finding, Flag};
use crate::remote::RemoteRecord;
use crate::storage::StorageError;
use crate::workspace::Notification;

/// Batches whose average creation times are this close are merged
const BATCH_EPSILON_SECS: f64 = 0.5;

/// How a pass reconciled the two batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    /// The remote batch was newer and replaced ours
    ReplacedLocal,
    /// Our batch was newer and replaced the remote one
    ReplacedRemote,
    /// Merged by id
    Merged,
}

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FindingReport {
    /// `None` when the pass was skipped
    pub strategy: Option<BatchStrategy>,
    pub pulled: usize,
    pub pushed: usize,
}

/// A finding with the line it points at in the current file content
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocatedFinding {
    #[serde(flatten)]
    pub finding: Finding,
    pub line: usize,
}

/// Sync engine for the findings of one project
pub struct FindingSync {
    ctx: SyncContext,
    coalescer: Coalescer,
    disposed: AtomicBool,
}

fn average_created(findings: &[Finding]) -> Option<f64> {
    if findings.is_empty() {
        return None;
    }
    Some(findings.iter().map(|f| f.created).sum::<f64>() / findings.len() as f64)
}

impl FindingSync {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            coalescer: Coalescer::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn check_disposed(&self) -> Result<(), SyncError> {
        if self.is_disposed() {
            Err(SyncError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Findings with their current lines, ordered by file and line
    pub async fn findings(&self) -> Result<Vec<LocatedFinding>, SyncError> {
        self.check_disposed()?;
        let findings = self.ctx.local.lock().await.list_findings()?;

        let mut documents: HashMap<String, Option<String>> = HashMap::new();
        let mut located: Vec<LocatedFinding> = findings
            .into_iter()
            .map(|finding| {
                let document = documents
                    .entry(finding.file_path.clone())
                    .or_insert_with(|| {
                        let path = self.ctx.workspace.absolute(&finding.file_path);
                        self.ctx.workspace.read_document(&path)
                    });
                let line = match document {
                    Some(document) => finding.anchor.relocate(document),
                    None => finding.anchor.line,
                };
                LocatedFinding { finding, line }
            })
            .collect();

        located.sort_by(|a, b| {
            a.finding
                .file_path
                .cmp(&b.finding.file_path)
                .then(a.line.cmp(&b.line))
        });
        Ok(located)
    }

    async fn timestamp(&self) -> f64 {
        if let Some(remote) = self.ctx.ready_remote() {
            match remote.server_time().await {
                Ok(now) => return now,
                Err(e) => warn!("Using local clock, server time unavailable: {}", e),
            }
        }
        now_secs()
    }

    /// Store the findings of an analysis run
    ///
    /// With `replace` the previous batch is dropped; otherwise findings are
    /// merged by id.
    pub async fn import(&self, findings: &[Finding], replace: bool) -> Result<usize, SyncError> {
        self.check_disposed()?;
        {
            let local = self.ctx.local.lock().await;
            if replace {
                local.replace_findings(findings)?;
            } else {
                for finding in findings {
                    local.upsert_finding(finding)?;
                }
            }
        }
        info!("Imported {} finding(s), replace={}", findings.len(), replace);

        if self.ctx.ready_remote().is_some() {
            if let Err(e) = self.request_sync().await {
                warn!("Sync after import failed: {}", e);
            }
        }
        Ok(findings.len())
    }

    /// Change the flag of a finding
    pub async fn set_flag(&self, id: &Uuid, flag: Flag) -> Result<Finding, SyncError> {
        self.check_disposed()?;
        let at = self.timestamp().await;

        let finding = {
            let local = self.ctx.local.lock().await;
            if !local.update_finding_flag(id, flag, at)? {
                return Err(StorageError::missing("finding", id).into());
            }
            local
                .finding(id)?
                .ok_or_else(|| StorageError::missing("finding", id))?
        };

        if let Some(remote) = self.ctx.ready_remote() {
            remote.push(&RemoteRecord::Finding(finding.clone())).await?;
        }
        debug!("Flagged finding {} as {}", id, flag.label());
        Ok(finding)
    }

    /// Delete one finding here and remotely
    pub async fn delete(&self, id: &Uuid) -> Result<(), SyncError> {
        self.check_disposed()?;
        if !self.ctx.local.lock().await.delete_finding(id)? {
            return Err(StorageError::missing("finding", id).into());
        }
        if let Some(remote) = self.ctx.ready_remote() {
            remote.delete_findings(Some(std::slice::from_ref(id))).await?;
        }
        Ok(())
    }

    /// Delete every finding here and remotely
    pub async fn clear(&self) -> Result<usize, SyncError> {
        self.check_disposed()?;
        let count = self.ctx.local.lock().await.clear_findings()?;
        if let Some(remote) = self.ctx.ready_remote() {
            remote.delete_findings(None).await?;
        }
        Ok(count)
    }

    /// Run a sync pass, or queue one behind the pass in progress
    pub async fn request_sync(&self) -> Result<Option<FindingReport>, SyncError> {
        self.check_disposed()?;
        self.coalescer.run(|| self.pass()).await.transpose()
    }

    async fn pass(&self) -> Result<FindingReport, SyncError> {
        self.check_disposed()?;
        let Some(remote) = self.ctx.ready_remote().cloned() else {
            debug!("Remote store not ready, skipping finding sync");
            return Ok(FindingReport::default());
        };

        let local_batch = self.ctx.local.lock().await.list_findings()?;
        self.check_disposed()?;
        let remote_batch = remote.pull_findings().await?;
        self.check_disposed()?;

        let strategy = match (average_created(&local_batch), average_created(&remote_batch)) {
            (Some(ours), Some(theirs)) if theirs - ours > BATCH_EPSILON_SECS => {
                BatchStrategy::ReplacedLocal
            }
            (Some(ours), Some(theirs)) if ours - theirs > BATCH_EPSILON_SECS => {
                BatchStrategy::ReplacedRemote
            }
            _ => BatchStrategy::Merged,
        };

        let mut report = FindingReport {
            strategy: Some(strategy),
            ..Default::default()
        };
        match strategy {
            BatchStrategy::ReplacedLocal => {
                let local = self.ctx.local.lock().await;
                self.check_disposed()?;
                local.replace_findings(&remote_batch)?;
                report.pulled = remote_batch.len();
            }
            BatchStrategy::ReplacedRemote => {
                self.check_disposed()?;
                remote.push_findings(&local_batch, true).await?;
                report.pushed = local_batch.len();
            }
            BatchStrategy::Merged => {
                let outgoing = self.merge(local_batch, remote_batch, &mut report).await?;
                if !outgoing.is_empty() {
                    self.check_disposed()?;
                    remote.push_findings(&outgoing, false).await?;
                }
            }
        }

        if report.pulled > 0 {
            self.check_disposed()?;
            self.ctx.notifier.notify(Notification::FindingsChanged {
                count: report.pulled,
            });
        }
        if report.pulled + report.pushed > 0 {
            info!("Finding sync: {:?}", report);
        }
        Ok(report)
    }

    /// Merge by id, returning the findings the remote needs
    async fn merge(
        &self,
        local_batch: Vec<Finding>,
        remote_batch: Vec<Finding>,
        report: &mut FindingReport,
    ) -> Result<Vec<Finding>, SyncError> {
        let mut remote_by_id: HashMap<Uuid, Finding> =
            remote_batch.into_iter().map(|f| (f.id, f)).collect();
        let mut outgoing = Vec::new();

        let local = self.ctx.local.lock().await;
        self.check_disposed()?;
        for ours in local_batch {
            match remote_by_id.remove(&ours.id) {
                None => outgoing.push(ours),
                Some(theirs) if theirs.flag_timestamp > ours.flag_timestamp => {
                    debug!("Taking remote flag {} for {}", theirs.flag.label(), ours.id);
                    local.update_finding_flag(&ours.id, theirs.flag, theirs.flag_timestamp)?;
                    report.pulled += 1;
                }
                Some(theirs) if theirs.flag_timestamp < ours.flag_timestamp => outgoing.push(ours),
                Some(_) => {}
            }
        }
        for theirs in remote_by_id.into_values() {
            local.upsert_finding(&theirs)?;
            report.pulled += 1;
        }

        report.pushed = outgoing.len();
        Ok(outgoing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::Anchor;
    use crate::models::DiagnosticPayload;
    use crate::remote::{Credentials, MemoryBackend, NoPrompt, RemoteStore};
    use crate::storage::LocalStore;
    use crate::workspace::{CollectingNotifier, MemoryWorkspace};
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct Fixture {
        sync: FindingSync,
        remote: Arc<RemoteStore>,
        local: Arc<Mutex<LocalStore>>,
        notifier: Arc<CollectingNotifier>,
    }

    async fn fixture(with_remote: bool) -> Fixture {
        let remote = Arc::new(
            RemoteStore::new(Arc::new(MemoryBackend::new())).for_project(&Uuid::new_v4()),
        );
        if with_remote {
            assert!(remote
                .enable(Credentials::new("ana", "pw", "mem"), &NoPrompt)
                .await
                .unwrap());
        }

        let workspace = Arc::new(MemoryWorkspace::new("/ws"));
        workspace.set_document(
            "src/db.rs",
            "fn query(input: &str) {\n    let sql = format!(\"SELECT {}\", input);\n    run(sql);\n}\n",
        );
        let notifier = Arc::new(CollectingNotifier::new());
        let local = Arc::new(Mutex::new(LocalStore::open_in_memory().unwrap()));

        let sync = FindingSync::new(SyncContext {
            local: local.clone(),
            remote: Some(remote.clone()),
            workspace,
            notifier: notifier.clone(),
            author: "ana".into(),
            anchor_lines: 5,
        });
        Fixture {
            sync,
            remote,
            local,
            notifier,
        }
    }

    fn finding(message: &str, created: f64) -> Finding {
        Finding::new(
            DiagnosticPayload {
                message: message.into(),
                severity: "WARNING".into(),
                ..Default::default()
            },
            Anchor {
                line: 1,
                text: "    let sql = format!(\"SELECT {}\", input);\n".into(),
                lines_before: 0,
            },
            "src/db.rs",
            created,
        )
    }

    fn ids(findings: &[Finding]) -> HashSet<Uuid> {
        findings.iter().map(|f| f.id).collect()
    }

    #[tokio::test]
    async fn test_newer_remote_batch_replaces_local() {
        let f = fixture(true).await;
        let old = vec![finding("old a", 100.0), finding("old b", 100.0)];
        f.local.lock().await.replace_findings(&old).unwrap();

        let new = vec![finding("new a", 200.0)];
        f.remote.push_findings(&new, true).await.unwrap();

        let report = f.sync.request_sync().await.unwrap().unwrap();
        assert_eq!(report.strategy, Some(BatchStrategy::ReplacedLocal));
        assert_eq!(report.pulled, 1);

        let local = f.local.lock().await.list_findings().unwrap();
        assert_eq!(ids(&local), ids(&new));
        assert_eq!(
            f.notifier.take(),
            vec![Notification::FindingsChanged { count: 1 }]
        );
    }

    #[tokio::test]
    async fn test_newer_local_batch_replaces_remote() {
        let f = fixture(true).await;
        f.remote
            .push_findings(&[finding("stale", 100.0)], true)
            .await
            .unwrap();

        let ours = vec![finding("fresh a", 300.0), finding("fresh b", 300.0)];
        f.local.lock().await.replace_findings(&ours).unwrap();

        let report = f.sync.request_sync().await.unwrap().unwrap();
        assert_eq!(report.strategy, Some(BatchStrategy::ReplacedRemote));
        assert_eq!(report.pushed, 2);
        assert_eq!(ids(&f.remote.pull_findings().await.unwrap()), ids(&ours));
    }

    #[tokio::test]
    async fn test_close_batches_merge_flags_by_timestamp() {
        let f = fixture(true).await;
        let shared = finding("shared", 100.0);
        let local_only = finding("local only", 100.0);
        let remote_only = finding("remote only", 100.2);

        let mut ours = shared.clone();
        ours.set_flag(Flag::Hot, 150.0);
        let mut theirs = shared.clone();
        theirs.set_flag(Flag::Resolved, 160.0);

        f.local
            .lock()
            .await
            .replace_findings(&[ours, local_only.clone()])
            .unwrap();
        f.remote
            .push_findings(&[theirs, remote_only.clone()], true)
            .await
            .unwrap();

        let report = f.sync.request_sync().await.unwrap().unwrap();
        assert_eq!(report.strategy, Some(BatchStrategy::Merged));
        assert_eq!(report.pulled, 2);
        assert_eq!(report.pushed, 1);

        let local = f.local.lock().await;
        assert_eq!(local.finding(&shared.id).unwrap().unwrap().flag, Flag::Resolved);
        assert!(local.finding(&remote_only.id).unwrap().is_some());
        drop(local);

        let remote = f.remote.pull_findings().await.unwrap();
        assert_eq!(remote.len(), 3);
        assert!(remote.iter().any(|r| r.id == local_only.id));
    }

    #[tokio::test]
    async fn test_local_flag_newer_is_pushed() {
        let f = fixture(true).await;
        let shared = finding("shared", 100.0);
        f.remote
            .push_findings(std::slice::from_ref(&shared), true)
            .await
            .unwrap();
        f.local.lock().await.replace_findings(std::slice::from_ref(&shared)).unwrap();

        let flagged = f.sync.set_flag(&shared.id, Flag::FalsePositive).await.unwrap();
        assert_eq!(flagged.flag, Flag::FalsePositive);

        let remote = f.remote.pull_findings().await.unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].flag, Flag::FalsePositive);

        let report = f.sync.request_sync().await.unwrap().unwrap();
        assert_eq!(report.pulled + report.pushed, 0);
    }

    #[tokio::test]
    async fn test_set_flag_on_missing_finding() {
        let f = fixture(false).await;
        let err = f.sync.set_flag(&Uuid::new_v4(), Flag::Hot).await.unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
    }

    #[tokio::test]
    async fn test_pass_skipped_without_remote() {
        let f = fixture(false).await;
        f.sync.import(&[finding("a", 1.0)], true).await.unwrap();

        let report = f.sync.request_sync().await.unwrap().unwrap();
        assert_eq!(report, FindingReport::default());
    }

    #[tokio::test]
    async fn test_import_then_clear() {
        let f = fixture(true).await;
        f.sync
            .import(&[finding("a", 10.0), finding("b", 10.0)], true)
            .await
            .unwrap();
        assert_eq!(f.remote.pull_findings().await.unwrap().len(), 2);

        assert_eq!(f.sync.clear().await.unwrap(), 2);
        assert!(f.remote.pull_findings().await.unwrap().is_empty());
        assert!(f.sync.findings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_one() {
        let f = fixture(true).await;
        let keep = finding("keep", 10.0);
        let gone = finding("gone", 10.0);
        f.sync.import(&[keep.clone(), gone.clone()], true).await.unwrap();

        f.sync.delete(&gone.id).await.unwrap();
        let remote = f.remote.pull_findings().await.unwrap();
        assert_eq!(ids(&remote), HashSet::from([keep.id]));
        assert!(f.sync.delete(&gone.id).await.is_err());
    }

    #[tokio::test]
    async fn test_findings_are_relocated() {
        let f = fixture(false).await;
        f.sync.import(&[finding("injection", 1.0)], true).await.unwrap();

        let located = f.sync.findings().await.unwrap();
        assert_eq!(located.len(), 1);
        assert_eq!(located[0].line, 1);
    }

    #[tokio::test]
    async fn test_dispose_while_merging_leaves_local_alone() {
        let f = fixture(true).await;
        let shared = finding("shared", 100.0);
        let mut theirs = shared.clone();
        theirs.set_flag(Flag::Hot, 150.0);
        let remote_only = finding("remote only", 100.0);
        f.local
            .lock()
            .await
            .replace_findings(std::slice::from_ref(&shared))
            .unwrap();
        let mut report = FindingReport::default();

        let sync = &f.sync;
        let guard = f.local.lock().await;
        let (result, ()) = tokio::join!(
            sync.merge(vec![shared.clone()], vec![theirs, remote_only.clone()], &mut report),
            async move {
                tokio::task::yield_now().await;
                sync.dispose();
                drop(guard);
            }
        );

        assert!(matches!(result, Err(SyncError::Disposed)));
        assert_eq!(report.pulled, 0);
        let local = f.local.lock().await;
        assert_eq!(local.finding(&shared.id).unwrap().unwrap().flag, Flag::Unflagged);
        assert!(local.finding(&remote_only.id).unwrap().is_none());
        drop(local);
        assert!(f.notifier.take().is_empty());
    }

    #[tokio::test]
    async fn test_disposed_engine_does_not_sync() {
        let f = fixture(true).await;
        f.remote
            .push_findings(&[finding("remote", 200.0)], true)
            .await
            .unwrap();
        f.sync.dispose();

        assert!(matches!(f.sync.request_sync().await, Err(SyncError::Disposed)));
        assert!(f.local.lock().await.list_findings().unwrap().is_empty());
        assert!(f.notifier.take().is_empty());
    }
}
