//! Two clients sharing one document store

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::Mutex;
use uuid::Uuid;

use annot_core::anchor::Anchor;
use annot_core::config::Config;
use annot_core::models::{DiagnosticPayload, Finding, Flag, Project};
use annot_core::remote::{Credentials, MemoryBackend, NoPrompt, RemoteStore};
use annot_core::storage::{LocalStore, ProjectDirectory};
use annot_core::sync::{sync_projects, BatchStrategy, CommentSync, FindingSync, SyncContext};
use annot_core::workspace::{CollectingNotifier, MemoryWorkspace, Notification};

const FILE: &str = "/ws/src/lib.rs";

fn token(i: usize) -> String {
    let mixed = (i as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    format!("{:012x}", mixed >> 16)
}

fn source(lines: usize) -> String {
    (0..lines)
        .map(|i| format!("let {} = {};\n", token(i), token(i + 7919)))
        .collect()
}

struct Client {
    comments: CommentSync,
    findings: FindingSync,
    workspace: Arc<MemoryWorkspace>,
    notifier: Arc<CollectingNotifier>,
}

async fn client(backend: &Arc<MemoryBackend>, project: &Uuid, author: &str, content: String) -> Client {
    let remote = Arc::new(RemoteStore::new(backend.clone()).for_project(project));
    assert!(remote
        .enable(Credentials::new(author, "pw", "mem"), &NoPrompt)
        .await
        .unwrap());

    let workspace = Arc::new(MemoryWorkspace::new("/ws"));
    workspace.set_document(FILE, content);
    let notifier = Arc::new(CollectingNotifier::new());

    let ctx = SyncContext {
        local: Arc::new(Mutex::new(LocalStore::open_in_memory().unwrap())),
        remote: Some(remote),
        workspace: workspace.clone(),
        notifier: notifier.clone(),
        author: author.to_string(),
        anchor_lines: 5,
    };
    Client {
        comments: CommentSync::new(ctx.clone()),
        findings: FindingSync::new(ctx),
        workspace,
        notifier,
    }
}

/// Ana has the file as is; Ben's copy has three extra lines on top
async fn pair() -> (Arc<MemoryBackend>, Client, Client) {
    let backend = Arc::new(MemoryBackend::new());
    let project = Uuid::new_v4();
    let ana = client(&backend, &project, "ana", source(30)).await;
    let ben = client(
        &backend,
        &project,
        "ben",
        format!("// a\n// b\n// c\n{}", source(30)),
    )
    .await;
    (backend, ana, ben)
}

fn finding(message: &str, line: usize, created: f64) -> Finding {
    Finding::new(
        DiagnosticPayload {
            message: message.into(),
            severity: "WARNING".into(),
            source: "semgrep-local".into(),
            ..Default::default()
        },
        Anchor::capture(&source(30), line, 5),
        "src/lib.rs",
        created,
    )
}

#[tokio::test]
async fn thread_follows_the_code_to_another_client() {
    let (_backend, ana, ben) = pair().await;

    let id = ana
        .comments
        .create_thread(Path::new(FILE), 10, "why clone here?")
        .await
        .unwrap();

    let report = ben.comments.request_sync().await.unwrap().unwrap();
    assert_eq!(report.threads_added, 1);
    assert_eq!(report.comments_added, 1);

    let thread = ben.comments.thread(&id).await.unwrap();
    assert_eq!(thread.line, 13);
    assert_eq!(thread.comments.len(), 1);
    assert_eq!(thread.comments[0].author, "ana");
    assert_eq!(thread.comments[0].body, "why clone here?");

    let seen = ben.notifier.take();
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::ThreadAdded { thread_id, line: 13, .. } if *thread_id == id
    )));
}

#[tokio::test]
async fn replies_and_edits_travel_both_ways() {
    let (backend, ana, ben) = pair().await;

    let id = ana
        .comments
        .create_thread(Path::new(FILE), 4, "off by one?")
        .await
        .unwrap();
    ben.comments.request_sync().await.unwrap();
    ben.comments.reply(&id, "checked, it is fine").await.unwrap();

    ana.comments.request_sync().await.unwrap();
    let thread = ana.comments.thread(&id).await.unwrap();
    assert_eq!(thread.comments.len(), 2);
    assert!(thread.comments.iter().any(|c| c.author == "ben"));

    // Edits win only when clearly newer
    backend.advance_clock(5.0);
    let first = thread
        .comments
        .iter()
        .find(|c| c.author == "ana")
        .unwrap()
        .id;
    ana.comments.edit_comment(&first, "off by one? (line moved)").await.unwrap();

    let report = ben.comments.request_sync().await.unwrap().unwrap();
    assert_eq!(report.comments_updated, 1);
    let thread = ben.comments.thread(&id).await.unwrap();
    assert!(thread
        .comments
        .iter()
        .any(|c| c.body == "off by one? (line moved)"));
}

#[tokio::test]
async fn deleted_thread_disappears_everywhere() {
    let (_backend, ana, ben) = pair().await;

    let id = ana
        .comments
        .create_thread(Path::new(FILE), 20, "dead code")
        .await
        .unwrap();
    ben.comments.request_sync().await.unwrap();
    assert!(ben.comments.thread(&id).await.is_some());

    ana.comments.delete_thread(&id).await.unwrap();
    let report = ben.comments.request_sync().await.unwrap().unwrap();
    assert!(report.tombstones_applied >= 1);
    assert!(ben.comments.thread(&id).await.is_none());
    assert!(ben.comments.threads().await.is_empty());

    // A later pass does not bring it back
    ana.comments.request_sync().await.unwrap();
    assert!(ana.comments.threads().await.is_empty());
}

#[tokio::test]
async fn ben_edits_his_copy_before_syncing() {
    let (_backend, ana, ben) = pair().await;

    let id = ana
        .comments
        .create_thread(Path::new(FILE), 25, "magic number")
        .await
        .unwrap();

    // Ben deletes the three extra lines and one more above the thread
    let mut lines: Vec<String> = source(30).lines().map(|l| format!("{}\n", l)).collect();
    lines.remove(2);
    ben.workspace.set_document(FILE, lines.concat());

    ben.comments.request_sync().await.unwrap();
    assert_eq!(ben.comments.thread(&id).await.unwrap().line, 24);
}

#[tokio::test]
async fn findings_batches_and_flags() {
    let (_backend, ana, ben) = pair().await;

    let batch = vec![
        finding("unchecked index", 3, 100.0),
        finding("shadowed binding", 17, 100.0),
    ];
    ana.findings.import(&batch, true).await.unwrap();

    let report = ben.findings.request_sync().await.unwrap().unwrap();
    assert_eq!(report.strategy, Some(BatchStrategy::Merged));
    assert_eq!(report.pulled, 2);
    let located = ben.findings.findings().await.unwrap();
    assert_eq!(located.len(), 2);
    assert!(located
        .iter()
        .any(|f| f.finding.diagnostic.message == "unchecked index" && f.line == 6));

    // Ben triages, Ana picks it up by flag time
    ben.findings.set_flag(&batch[0].id, Flag::Hot).await.unwrap();
    ana.findings.request_sync().await.unwrap();
    let flagged = ana
        .findings
        .findings()
        .await
        .unwrap()
        .into_iter()
        .find(|f| f.finding.id == batch[0].id)
        .unwrap();
    assert_eq!(flagged.finding.flag, Flag::Hot);

    // A newer run replaces the older batch on both sides
    let rerun = vec![finding("unchecked index", 3, 200.0)];
    ana.findings.import(&rerun, true).await.unwrap();
    let report = ben.findings.request_sync().await.unwrap().unwrap();
    assert_eq!(report.strategy, Some(BatchStrategy::ReplacedLocal));
    let located = ben.findings.findings().await.unwrap();
    assert_eq!(located.len(), 1);
    assert_eq!(located[0].finding.id, rerun[0].id);
    assert_eq!(located[0].finding.flag, Flag::Unflagged);
}

#[tokio::test]
async fn project_removal_wins() {
    let temp = TempDir::new().unwrap();
    let config = Config {
        data_dir: temp.path().to_path_buf(),
        ..Config::default()
    };
    let backend = Arc::new(MemoryBackend::new());
    let remote = RemoteStore::new(backend.clone());
    assert!(remote
        .enable(Credentials::new("ana", "pw", "mem"), &NoPrompt)
        .await
        .unwrap());

    let ours = ProjectDirectory::open_in_memory().unwrap();
    let theirs = ProjectDirectory::open_in_memory().unwrap();

    let project = Project::new("shared");
    ours.upsert(&project).unwrap();
    sync_projects(&ours, &remote, &config).await.unwrap();

    let report = sync_projects(&theirs, &remote, &config).await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(theirs.list().unwrap()[0].uuid, project.uuid);

    theirs.remove(&project.uuid).unwrap();
    sync_projects(&theirs, &remote, &config).await.unwrap();

    let report = sync_projects(&ours, &remote, &config).await.unwrap();
    assert_eq!(report.removed, 1);
    assert!(ours.list().unwrap().is_empty());
}
