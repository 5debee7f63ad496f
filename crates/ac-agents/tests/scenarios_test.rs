//! End-to-end scenarios over the public control-plane API, using the mock
//! adapter and the scripted process runner.

use std::sync::Arc;
use std::time::Duration;

use ac_adapters::MockAdapter;
use ac_agents::backlog::BacklogStore;
use ac_agents::decomposer::{ProjectContext, TaskDecomposer};
use ac_agents::graph;
use ac_agents::manager::FailureAction;
use ac_agents::merger::PullRequestSpec;
use ac_agents::pool::PoolConfig;
use ac_agents::{ManagerAgent, ManagerConfig, MergeRequest, MergerAgent, MergerConfig};
use ac_bus::{MessageBus, MessageKind};
use ac_core::ids;
use ac_core::types::{ParentTask, PrStatus, SubTaskStatus, WorkerError, WorkerSpec};
use ac_git::process::ScriptedRunner;
use ac_git::GitManager;

fn manager(
    content: &str,
    dir: &std::path::Path,
    bus: MessageBus,
    pool: PoolConfig,
) -> Arc<ManagerAgent> {
    Arc::new(ManagerAgent::new(
        ManagerConfig {
            pool,
            ..Default::default()
        },
        Arc::new(MockAdapter::new().with_content(content)),
        bus,
        BacklogStore::new(dir.join("workflows/backlog")),
        dir.join("runtime"),
    ))
}

// ---------------------------------------------------------------------------
// Decomposition round-trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn decomposition_round_trip_persists_backlog() {
    let dir = tempfile::tempdir().unwrap();
    let plan = r#"{"subTasks": [
        {"title": "Create user model", "description": "Define the user entity and storage"},
        {"title": "Implement user API", "description": "Expose CRUD endpoints for users"}
    ]}"#;
    let backlog = BacklogStore::new(dir.path().join("workflows/backlog"));
    let decomposer = TaskDecomposer::new(
        Arc::new(MockAdapter::new().with_content(plan)),
        backlog.clone(),
    );

    let outcome = decomposer
        .decompose(
            "Create a user management feature",
            &ProjectContext::new("proj-1"),
        )
        .await
        .unwrap();

    assert_eq!(outcome.sub_tasks.len(), 2);
    let parent = &outcome.parent_id;
    assert_eq!(outcome.sub_tasks[0].id, format!("{parent}-001"));
    assert_eq!(outcome.sub_tasks[1].id, format!("{parent}-002"));

    for sub in &outcome.sub_tasks {
        assert_eq!(sub.status, SubTaskStatus::Pending);
        assert_eq!(sub.parent_id, *parent);

        // File contract: frontmatter parent_id and a title heading.
        let content = std::fs::read_to_string(backlog.path_for(&sub.id)).unwrap();
        assert!(content.contains(&format!("parent_id: '{}'", parent)));
        assert!(content.contains(&format!("# {}", sub.title)));
    }
}

// ---------------------------------------------------------------------------
// Protected-branch merge rejection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn protected_branch_merge_is_rejected_without_git() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    let git = Arc::new(GitManager::new(runner.clone(), dir.path().join("runtime")));
    let merger = MergerAgent::new(
        git,
        Arc::new(MockAdapter::new()),
        dir.path().join("runtime"),
        MergerConfig::default(),
    );

    let result = merger
        .merge(&MergeRequest {
            run_id: ids::run_id(),
            repo_dir: dir.path().to_path_buf(),
            source: "feature/x".into(),
            target: Some("main".into()),
            ticket: "TICKET-1".into(),
            message: None,
        })
        .await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("direct merge forbidden"));
    assert!(result.commit.is_none());
    assert!(runner.calls().is_empty(), "no git invocation may happen");
}

// ---------------------------------------------------------------------------
// Approved PR merge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approved_pr_merges_into_protected_branch() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(
        ScriptedRunner::new()
            .push_ok("M  src/lib.rs\n") // status
            .push_ok("2\n") // rev-list
            .push_ok("") // checkout main
            .push_ok("") // merge
            .push_ok("abc999\n"), // rev-parse
    );
    let git = Arc::new(GitManager::new(runner.clone(), dir.path().join("runtime")));
    let merger = MergerAgent::new(
        git,
        Arc::new(MockAdapter::new()),
        dir.path().join("runtime"),
        MergerConfig::default(),
    );

    let run_id = ids::run_id();
    let pr = merger
        .create_pull_request(
            &run_id,
            dir.path(),
            PullRequestSpec {
                title: "Release".into(),
                description: Some("release train".into()),
                source_branch: "develop".into(),
                target_branch: "main".into(),
                ticket_id: "TICKET-2".into(),
            },
        )
        .await
        .unwrap();

    merger.approve_pull_request(&run_id, &pr.id).await.unwrap();
    let result = merger.merge_pull_request(&run_id, dir.path(), &pr.id).await;

    assert!(result.success);
    assert_eq!(result.commit.as_deref(), Some("abc999"));
    assert_eq!(
        merger.pull_request(&pr.id).await.unwrap().status,
        PrStatus::Merged
    );
    assert!(runner
        .call_lines()
        .iter()
        .any(|l| l.contains("merge --no-ff develop")));
}

// ---------------------------------------------------------------------------
// Failure escalation ladder
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_failures_support_then_reassign() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MessageBus::new();
    let plan = r#"{"subTasks": [{"title": "Flaky work", "description": "Breaks a lot"}]}"#;
    let mgr = manager(plan, dir.path(), bus.clone(), PoolConfig::default());

    let task = mgr
        .receive_task(ParentTask::new(ids::task_id(), "proj-1", "do the thing"))
        .await
        .unwrap();
    let outcome = mgr
        .decompose_task(&task.id, &ProjectContext::new("proj-1"))
        .await
        .unwrap();
    let sub_id = outcome.sub_tasks[0].id.clone();

    let worker = mgr.hire_worker(WorkerSpec::new("primary")).await.unwrap();
    let spare = mgr.hire_worker(WorkerSpec::new("spare")).await.unwrap();

    let boom = WorkerError {
        code: "TEST_FAILURE".into(),
        message: "assertions failed".into(),
        recoverable: true,
    };

    for expected_records in 1..=3u32 {
        mgr.assign_task(&sub_id, &worker).await.unwrap();
        mgr.handle_task_failed(&worker, &sub_id, boom.clone())
            .await
            .unwrap();
        assert_eq!(mgr.failure_history().await.len(), expected_records as usize);
    }

    // After the third consecutive failure, guidance went to the worker.
    let guidance: Vec<_> = bus
        .drain(&worker)
        .into_iter()
        .filter(|m| m.kind == MessageKind::Guidance)
        .collect();
    assert!(!guidance.is_empty(), "support must be dispatched");

    // Fourth failure: the work moves to a different idle worker.
    mgr.assign_task(&sub_id, &worker).await.unwrap();
    let action = mgr
        .handle_task_failed(&worker, &sub_id, boom)
        .await
        .unwrap();
    match action {
        FailureAction::Reassigned { new_worker } => {
            assert_eq!(new_worker.as_deref(), Some(spare.as_str()));
        }
        FailureAction::Escalated => {}
        other => panic!("expected reassignment or escalation, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Pool scaling from a cold start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn workload_scales_empty_pool_up() {
    let dir = tempfile::tempdir().unwrap();
    let plan = r#"{"subTasks": [
        {"title": "a", "description": "work a"},
        {"title": "b", "description": "work b"},
        {"title": "c", "description": "work c"},
        {"title": "d", "description": "work d"},
        {"title": "e", "description": "work e"}
    ]}"#;
    let mgr = manager(
        plan,
        dir.path(),
        MessageBus::new(),
        PoolConfig {
            min_workers: 0,
            max_workers: 5,
            scale_up_threshold: 2.0,
            cooldown: Duration::from_secs(0),
            ..Default::default()
        },
    );

    let task = mgr
        .receive_task(ParentTask::new(ids::task_id(), "proj-1", "big batch"))
        .await
        .unwrap();
    mgr.decompose_task(&task.id, &ProjectContext::new("proj-1"))
        .await
        .unwrap();

    let report = mgr.scale_workers_by_workload().await;
    assert_eq!(report.action, "scaled_up");
    assert_eq!(report.workers_added, 3); // ceil(5 / 2), clamped to max
    assert_eq!(report.pool_size, 3);
}

// ---------------------------------------------------------------------------
// Independent-group detection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn independent_services_form_one_parallel_group() {
    let dir = tempfile::tempdir().unwrap();
    let plan = r#"{"subTasks": [
        {"title": "Create user service", "description": "Stand up the user service"},
        {"title": "Create product service", "description": "Stand up the product service"},
        {"title": "Create order service", "description": "Stand up the order service"}
    ]}"#;
    let decomposer = TaskDecomposer::new(
        Arc::new(MockAdapter::new().with_content(plan)),
        BacklogStore::new(dir.path().join("workflows/backlog")),
    );

    let outcome = decomposer
        .decompose("Build three services", &ProjectContext::new("proj-1"))
        .await
        .unwrap();

    let g = graph::analyze(&outcome.sub_tasks);
    assert_eq!(g.nodes.len(), 3);
    assert!(g.edges.is_empty());
    assert!(!g.has_cycle);

    let levels = graph::parallel_levels(&g);
    assert_eq!(levels.len(), 1);
    assert_eq!(levels[0].len(), 3);
}
