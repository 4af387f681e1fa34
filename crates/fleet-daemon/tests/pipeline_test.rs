mod common;

use std::sync::Arc;

use serde_json::json;

use common::{prod_host, secret, snapshot_host, worker, worker_with, FakeControlPlane, FAIL, SUCCEED};
use fleet_core::store::QueueItem;
use fleet_core::types::{RotationLink, RunStatus, SecretType, DEFAULT_PROJECT_ID};
use fleet_daemon::pipeline::{Disposition, Pipeline};
use fleet_daemon::strategy::RunnerStrategy;

const PLAYBOOK: &str = "- hosts: all\n  tasks: []\n";

fn item(run_id: i64) -> QueueItem {
    QueueItem::new(DEFAULT_PROJECT_ID, run_id)
}

fn single_run(cp: &FakeControlPlane) {
    cp.add_playbook(1, Some(PLAYBOOK));
    cp.add_run(10, 1, vec![snapshot_host(1)]);
}

#[tokio::test]
async fn successful_run_streams_output_and_marks_success() {
    let cp = FakeControlPlane::new();
    single_run(&cp);
    let w = worker(cp, SUCCEED).await;

    let disposition = Pipeline::new(&w.ctx).execute(item(10)).await.expect("pipeline");

    assert_eq!(disposition, Disposition::Handled);
    let run = w.cp.run(10);
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.finished_at.is_some());

    let log = w.cp.log(10);
    assert!(log.starts_with("==> start run_id=10 playbook=playbook-1\n"), "log: {log}");
    assert!(log.contains("==> exec: sh "));
    assert!(log.contains("ok: [web-1]"));
    assert!(log.trim_end().ends_with("==> done: success"));

    let dir = w.run_dir(10);
    assert_eq!(std::fs::read_to_string(dir.join("playbook.yml")).unwrap(), PLAYBOOK);
    assert_eq!(std::fs::read_to_string(dir.join("run.log")).unwrap(), log);
    assert!(dir.join("inventory.public.ini").exists());
    assert!(!dir.join("inventory.ini").exists());
    assert!(!dir.join("extra_vars.json").exists());
}

#[tokio::test]
async fn nonzero_exit_marks_failed_with_exit_code() {
    let cp = FakeControlPlane::new();
    single_run(&cp);
    let w = worker(cp, FAIL).await;

    Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert_eq!(w.cp.status(10), RunStatus::Failed);
    let log = w.cp.log(10);
    assert!(log.contains("UNREACHABLE"));
    assert!(log.contains("==> done: failed (exit=2)"));
}

#[tokio::test]
async fn missing_playbook_content_fails_without_executing() {
    let cp = FakeControlPlane::new();
    cp.add_playbook(1, None);
    cp.add_run(10, 1, vec![snapshot_host(1)]);
    let w = worker(cp, SUCCEED).await;

    let disposition = Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert_eq!(disposition, Disposition::Handled);
    assert_eq!(w.cp.status(10), RunStatus::Failed);
    let log = w.cp.log(10);
    assert!(log.contains("==> error: playbook has no stored content"));
    assert!(!log.contains("==> exec"));
}

#[tokio::test]
async fn empty_target_set_fails() {
    let cp = FakeControlPlane::new();
    cp.add_playbook(1, Some(PLAYBOOK));
    cp.add_run(10, 1, vec![]);
    let w = worker(cp, SUCCEED).await;

    Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert_eq!(w.cp.status(10), RunStatus::Failed);
    assert!(w.cp.log(10).contains("==> error: no target hosts for this run"));
}

#[tokio::test]
async fn refused_claim_is_handled_without_touching_the_run() {
    let cp = FakeControlPlane::new();
    single_run(&cp);
    cp.update_run(10, |r| r.status = RunStatus::Running);
    let w = worker(cp, SUCCEED).await;

    let disposition = Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert_eq!(disposition, Disposition::Handled);
    assert_eq!(w.cp.status(10), RunStatus::Running);
    assert_eq!(w.cp.calls("append_log"), 0);
    assert_eq!(w.cp.calls("set_status"), 0);
}

#[tokio::test]
async fn server_error_on_claim_asks_for_retry() {
    let cp = FakeControlPlane::new();
    single_run(&cp);
    cp.state().claim_failures.push_back(502);
    let w = worker(cp, SUCCEED).await;

    let disposition = Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert_eq!(disposition, Disposition::Retry);
    assert_eq!(w.cp.status(10), RunStatus::Pending);
}

#[tokio::test]
async fn run_exceeding_timeout_is_killed_and_failed() {
    let cp = FakeControlPlane::new();
    single_run(&cp);
    let w = worker_with(cp, "echo started\nsleep 30\necho unreachable\n", |c| {
        c.execution.run_timeout_secs = 1;
    })
    .await;

    let started = std::time::Instant::now();
    Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert!(started.elapsed() < std::time::Duration::from_secs(20));
    assert_eq!(w.cp.status(10), RunStatus::Failed);
    let log = w.cp.log(10);
    assert!(log.contains("started"));
    assert!(log.contains("==> timeout: exceeded 5s, stopping process"));
    assert!(!log.contains("unreachable"));
    assert!(!log.contains("==> done"));
}

#[tokio::test]
async fn secret_references_are_revealed_once_and_scrubbed_afterwards() {
    let cp = FakeControlPlane::new();
    single_run(&cp);
    cp.add_secret(secret(7, SecretType::Password), "hunter2", None);
    cp.state().playbooks.get_mut(&1).unwrap().variables = json!({
        "db_password": "{{ secret:7 }}",
        "dsn": "pw={{secret:7}}",
    })
    .as_object()
    .cloned()
    .unwrap();
    let script = "for a in \"$@\"; do case \"$a\" in @*) cat \"${a#@}\"; echo;; esac; done\n";
    let w = worker(cp, script).await;

    Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert_eq!(w.cp.status(10), RunStatus::Success);
    assert_eq!(w.cp.calls("reveal_secret"), 1);
    let log = w.cp.log(10);
    assert!(log.contains("\"db_password\":\"hunter2\""), "log: {log}");
    assert!(log.contains("\"dsn\":\"pw=hunter2\""));
    assert!(!w.run_dir(10).join("extra_vars.json").exists());
}

#[tokio::test]
async fn extra_vars_override_playbook_variables() {
    let cp = FakeControlPlane::new();
    single_run(&cp);
    cp.state().playbooks.get_mut(&1).unwrap().variables =
        json!({"env": "base", "keep": 1}).as_object().cloned().unwrap();
    cp.update_run(10, |r| {
        r.target_snapshot.extra_vars = json!({"env": "override"}).as_object().cloned().unwrap();
    });
    let script = "for a in \"$@\"; do case \"$a\" in @*) cat \"${a#@}\"; echo;; esac; done\n";
    let w = worker(cp, script).await;

    Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    let log = w.cp.log(10);
    assert!(log.contains("\"env\":\"override\""));
    assert!(log.contains("\"keep\":1"));
}

#[tokio::test]
async fn unrevealable_secret_fails_the_run() {
    let cp = FakeControlPlane::new();
    single_run(&cp);
    cp.add_secret(secret(7, SecretType::Password), "hunter2", None);
    cp.state().unrevealable.insert(7);
    cp.update_run(10, |r| {
        r.target_snapshot.extra_vars = json!({"pw": "{{ secret:7 }}"}).as_object().cloned().unwrap();
    });
    let w = worker(cp, SUCCEED).await;

    Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert_eq!(w.cp.status(10), RunStatus::Failed);
    let log = w.cp.log(10);
    assert!(log.contains("==> error: secret 7 could not be revealed"));
    assert!(!log.contains("==> exec"));
}

#[tokio::test]
async fn password_credentials_only_reach_the_private_inventory() {
    let cp = FakeControlPlane::new();
    cp.add_playbook(1, Some(PLAYBOOK));
    let mut host = snapshot_host(1);
    host.credential_id = Some(5);
    cp.add_run(10, 1, vec![host]);
    cp.add_secret(secret(5, SecretType::Password), "s3cret pw", None);
    let w = worker(cp, "cat inventory.ini\n").await;

    Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert_eq!(w.cp.status(10), RunStatus::Success);
    assert!(w.cp.log(10).contains("web-1 ansible_host=10.0.0.1 ansible_port=22 ansible_user=root ansible_password=s3cret\\ pw"));
    let public = std::fs::read_to_string(w.run_dir(10).join("inventory.public.ini")).unwrap();
    assert!(public.contains("web-1 ansible_host=10.0.0.1"));
    assert!(!public.contains("s3cret"));
    assert!(!w.run_dir(10).join("inventory.ini").exists());
}

#[tokio::test]
async fn sensitive_artifacts_can_be_kept() {
    let cp = FakeControlPlane::new();
    single_run(&cp);
    let w = worker_with(cp, SUCCEED, |c| c.execution.keep_sensitive_artifacts = true).await;

    Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert!(w.run_dir(10).join("inventory.ini").exists());
    assert!(w.run_dir(10).join("extra_vars.json").exists());
}

#[tokio::test]
async fn hosts_outside_worker_scope_are_skipped() {
    let cp = FakeControlPlane::new();
    cp.add_playbook(1, Some(PLAYBOOK));
    let mut prod = snapshot_host(2);
    prod.environment = Some("prod".into());
    cp.add_run(10, 1, vec![snapshot_host(1), prod]);
    let w = worker_with(cp, "cat inventory.ini\n", |c| {
        c.scope.allowed_environments = Some(vec!["dev".into()]);
    })
    .await;

    Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert_eq!(w.cp.status(10), RunStatus::Success);
    let log = w.cp.log(10);
    assert!(log.contains("==> scope: 1 host(s) outside worker scope skipped"));
    assert!(log.contains("web-1 ansible_host"));
    assert!(!log.contains("web-2 ansible_host"));
}

#[tokio::test]
async fn facts_run_without_structured_runner_stores_nothing() {
    let cp = FakeControlPlane::new();
    single_run(&cp);
    cp.update_run(10, |r| r.target_snapshot.facts_run = true);
    let w = worker(cp, SUCCEED).await;

    Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert_eq!(w.cp.status(10), RunStatus::Success);
    assert!(w.cp.log(10).contains("==> facts: structured runner unavailable, facts not stored"));
    assert!(w.cp.state().facts.is_empty());
}

/// Stand-in for the structured runner: checks its private data dir and
/// prints a JSON event stream with a fact-gathering result.
const RUNNER: &str = r##"test "$1" = run || exit 64
test -f "$2/project/playbook.yml" || exit 65
test -f "$2/inventory/hosts" || exit 66
test -f "$2/env/extravars" || exit 67
echo '{"event":"playbook_on_start","stdout":""}'
echo '{"event":"runner_on_ok","stdout":"ok: [web-1]","event_data":{"task":"Gathering Facts","res":{"ansible_facts":{"os_family":"Debian"}}}}'
echo '{"event":"playbook_on_stats","stdout":"PLAY RECAP"}'
exit 0
"##;

fn runner_strategy(w: &mut common::TestWorker) {
    let script = w.dir.path().join("runner.sh");
    std::fs::write(&script, RUNNER).expect("write runner script");
    w.ctx.strategy = Arc::new(RunnerStrategy::new(vec!["sh".into(), script.display().to_string()]));
}

#[tokio::test]
async fn structured_runner_streams_events_and_stores_facts() {
    let cp = FakeControlPlane::new();
    single_run(&cp);
    cp.update_run(10, |r| r.target_snapshot.facts_run = true);
    let mut w = worker(cp, SUCCEED).await;
    runner_strategy(&mut w);

    Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert_eq!(w.cp.status(10), RunStatus::Success);
    let log = w.cp.log(10);
    assert!(log.contains("==> exec: ansible-runner"));
    assert!(log.contains("ok: [web-1]\nPLAY RECAP\n"), "log: {log}");
    assert!(!log.contains("runner_on_ok"));
    assert!(log.contains("==> done: success (rc=0)"));
    assert_eq!(w.cp.state().facts, vec![(1, json!({ "os_family": "Debian" }))]);

    let dir = w.run_dir(10);
    assert!(!dir.join("runner").exists());
    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.join("runner.summary.json")).unwrap()).unwrap();
    assert_eq!(summary["rc"], 0);
    assert_eq!(summary["status"], "success");
}

#[tokio::test]
async fn facts_are_stored_for_the_only_host_left_in_scope() {
    let cp = FakeControlPlane::new();
    cp.add_playbook(1, Some(PLAYBOOK));
    cp.add_run(10, 1, vec![snapshot_host(1), prod_host(2)]);
    cp.update_run(10, |r| r.target_snapshot.facts_run = true);
    let mut w = worker_with(cp, SUCCEED, |c| {
        c.scope.allowed_environments = Some(vec!["dev".into()]);
    })
    .await;
    runner_strategy(&mut w);

    Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert_eq!(w.cp.status(10), RunStatus::Success);
    assert!(!w.cp.log(10).contains("==> facts:"));
    assert_eq!(w.cp.state().facts, vec![(1, json!({ "os_family": "Debian" }))]);
}

#[tokio::test]
async fn facts_need_a_single_host() {
    let cp = FakeControlPlane::new();
    cp.add_playbook(1, Some(PLAYBOOK));
    cp.add_run(10, 1, vec![snapshot_host(1), snapshot_host(2)]);
    cp.update_run(10, |r| r.target_snapshot.facts_run = true);
    let mut w = worker(cp, SUCCEED).await;
    runner_strategy(&mut w);

    Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert!(w.cp.log(10).contains("==> facts: fact collection needs exactly one host, got 2"));
    assert!(w.cp.state().facts.is_empty());
}

#[tokio::test]
async fn successful_rotation_run_applies_temp_value_and_deletes_it() {
    let cp = FakeControlPlane::new();
    single_run(&cp);
    cp.add_secret(secret(20, SecretType::Password), "old", None);
    cp.add_secret(secret(21, SecretType::Password), "new-value", None);
    cp.update_run(10, |r| {
        r.target_snapshot.rotation = Some(RotationLink {
            target_secret_id: 20,
            temp_secret_id: 21,
        })
    });
    let w = worker(cp, SUCCEED).await;

    Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert_eq!(w.cp.status(10), RunStatus::Success);
    assert_eq!(w.cp.secret_value(20).as_deref(), Some("new-value"));
    assert_eq!(w.cp.secret_value(21), None);
    assert_eq!(w.cp.state().deleted_secrets, vec![21]);
}

#[tokio::test]
async fn failed_rotation_run_keeps_target_and_still_deletes_temp() {
    let cp = FakeControlPlane::new();
    single_run(&cp);
    cp.add_secret(secret(20, SecretType::Password), "old", None);
    cp.add_secret(secret(21, SecretType::Password), "new-value", None);
    cp.update_run(10, |r| {
        r.target_snapshot.rotation = Some(RotationLink {
            target_secret_id: 20,
            temp_secret_id: 21,
        })
    });
    let w = worker(cp, FAIL).await;

    Pipeline::new(&w.ctx).execute(item(10)).await.unwrap();

    assert_eq!(w.cp.status(10), RunStatus::Failed);
    assert_eq!(w.cp.secret_value(20).as_deref(), Some("old"));
    assert_eq!(w.cp.state().deleted_secrets, vec![21]);
    assert!(w.cp.state().rotations.is_empty());
}
