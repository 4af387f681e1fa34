mod common;

use chrono::{Duration, Utc};

use serde_json::Map;

use common::{prod_host, snapshot_host, worker, FakeControlPlane, SUCCEED};
use fleet_core::types::{Approval, ApprovalStatus, RunStatus, Schedule, ScheduleKind, DEFAULT_PROJECT_ID};
use fleet_daemon::approval::{ApprovalGate, Decision};
use fleet_daemon::consumer::process_one;
use fleet_daemon::scheduler::Scheduler;
use fleet_daemon::watchdog::{Watchdog, WatchdogReport};

fn old_pending_run(cp: &FakeControlPlane, id: i64) {
    cp.add_playbook(1, Some("- hosts: all\n"));
    cp.add_run(id, 1, vec![snapshot_host(1)]);
    cp.update_run(id, |r| r.created_at = Some(Utc::now() - Duration::minutes(10)));
}

fn approval(cp: &FakeControlPlane, id: i64, run_id: i64, status: ApprovalStatus) {
    cp.state().approvals.insert(
        id,
        Approval {
            id,
            run_id,
            status,
            requested_by: Some("worker".into()),
            decided_by: Some("alice".into()),
            reason: None,
            decided_at: None,
        },
    );
    cp.update_run(run_id, |r| r.target_snapshot.approval_id = Some(id));
}

#[tokio::test]
async fn stalled_pending_run_is_requeued_once_per_lock_window() {
    let cp = FakeControlPlane::new();
    old_pending_run(&cp, 10);
    let w = worker(cp, SUCCEED).await;
    let watchdog = Watchdog::new(&w.ctx);

    let first = watchdog.sweep(Utc::now()).await;
    let second = watchdog.sweep(Utc::now()).await;

    assert_eq!(first.requeued, 1);
    assert_eq!(second.requeued, 0);
    assert_eq!(w.ctx.store.items().await.unwrap(), vec!["1:10".to_string()]);
}

#[tokio::test]
async fn requeue_goes_to_the_front_of_the_queue() {
    let cp = FakeControlPlane::new();
    old_pending_run(&cp, 10);
    let w = worker(cp, SUCCEED).await;
    w.ctx.store.push_back("1:99").await.unwrap();

    Watchdog::new(&w.ctx).sweep(Utc::now()).await;

    assert_eq!(
        w.ctx.store.items().await.unwrap(),
        vec!["1:10".to_string(), "1:99".to_string()]
    );
}

#[tokio::test]
async fn fresh_pending_run_is_left_alone() {
    let cp = FakeControlPlane::new();
    cp.add_playbook(1, Some("- hosts: all\n"));
    cp.add_run(10, 1, vec![snapshot_host(1)]);
    let w = worker(cp, SUCCEED).await;

    let report = Watchdog::new(&w.ctx).sweep(Utc::now()).await;

    assert_eq!(report, WatchdogReport::default());
    assert!(w.ctx.store.is_empty().await.unwrap());
}

#[tokio::test]
async fn run_awaiting_approval_is_not_requeued() {
    let cp = FakeControlPlane::new();
    old_pending_run(&cp, 10);
    approval(&cp, 500, 10, ApprovalStatus::Pending);
    old_pending_run(&cp, 11);
    cp.update_run(11, |r| r.target_snapshot.approval_status = Some(ApprovalStatus::Pending));
    let w = worker(cp, SUCCEED).await;

    let report = Watchdog::new(&w.ctx).sweep(Utc::now()).await;

    assert_eq!(report.requeued, 0);
    assert!(w.ctx.store.is_empty().await.unwrap());
}

#[tokio::test]
async fn approved_run_is_queued() {
    let cp = FakeControlPlane::new();
    old_pending_run(&cp, 10);
    approval(&cp, 500, 10, ApprovalStatus::Approved);
    let w = worker(cp, SUCCEED).await;

    let report = Watchdog::new(&w.ctx).sweep(Utc::now()).await;

    assert_eq!(report.requeued, 1);
    assert_eq!(w.ctx.store.items().await.unwrap(), vec!["1:10".to_string()]);
}

#[tokio::test]
async fn rejected_run_is_failed() {
    let cp = FakeControlPlane::new();
    old_pending_run(&cp, 10);
    approval(&cp, 500, 10, ApprovalStatus::Rejected);
    let w = worker(cp, SUCCEED).await;

    let report = Watchdog::new(&w.ctx).sweep(Utc::now()).await;

    assert_eq!(report.rejected, 1);
    assert_eq!(w.cp.status(10), RunStatus::Failed);
    assert!(w.cp.log(10).contains("==> approval rejected by alice; marking failed"));
    assert!(w.ctx.store.is_empty().await.unwrap());
}

#[tokio::test]
async fn stale_running_run_is_failed() {
    let cp = FakeControlPlane::new();
    cp.add_playbook(1, Some("- hosts: all\n"));
    cp.add_run(10, 1, vec![snapshot_host(1)]);
    cp.add_run(11, 1, vec![snapshot_host(1)]);
    cp.update_run(10, |r| {
        r.status = RunStatus::Running;
        r.started_at = Some(Utc::now() - Duration::hours(2));
    });
    cp.update_run(11, |r| {
        r.status = RunStatus::Running;
        r.started_at = Some(Utc::now() - Duration::minutes(5));
    });
    let w = worker(cp, SUCCEED).await;

    let report = Watchdog::new(&w.ctx)
        .sweep_project(DEFAULT_PROJECT_ID, Utc::now())
        .await
        .unwrap();

    assert_eq!(report.reaped, 1);
    assert_eq!(w.cp.status(10), RunStatus::Failed);
    assert_eq!(w.cp.status(11), RunStatus::Running);
    assert!(w.cp.log(10).contains("==> watchdog: run stuck (running for more than"));
}

#[tokio::test]
async fn gated_run_whose_approval_request_fails_is_never_executed() {
    let cp = FakeControlPlane::new();
    cp.add_playbook(1, Some("- hosts: all\n"));
    cp.add_host(prod_host(1));
    cp.state().playbooks.get_mut(&1).unwrap().schedule = Some(Schedule {
        enabled: true,
        kind: ScheduleKind::Interval,
        value: "60".into(),
        host_ids: vec![1],
        group_ids: vec![],
        extra_vars: Map::new(),
        dry_run: false,
        last_run_at: None,
    });
    cp.state().refuse_approval = true;
    let w = worker(cp, SUCCEED).await;

    assert_eq!(Scheduler::new(&w.ctx).sweep(Utc::now()).await, 0);
    assert_eq!(w.cp.status(1001), RunStatus::Failed);
    assert!(w.cp.log(1001).contains("==> error: approval request failed"));

    let later = Utc::now() + Duration::hours(1);
    assert_eq!(Watchdog::new(&w.ctx).sweep(later).await, WatchdogReport::default());
    assert!(w.ctx.store.is_empty().await.unwrap());

    process_one(&w.ctx, "1:1001").await;
    assert_eq!(w.cp.status(1001), RunStatus::Failed);
    assert!(!w.cp.log(1001).contains("==> start"));
}

#[tokio::test]
async fn held_protected_run_gets_an_approval_instead_of_the_queue() {
    let cp = FakeControlPlane::new();
    cp.add_playbook(1, Some("- hosts: all\n"));
    cp.add_run(10, 1, vec![prod_host(1)]);
    cp.update_run(10, |r| r.created_at = Some(Utc::now() - Duration::minutes(10)));
    let w = worker(cp, SUCCEED).await;
    let watchdog = Watchdog::new(&w.ctx);

    let first = watchdog.sweep(Utc::now()).await;
    let second = watchdog.sweep(Utc::now()).await;

    assert_eq!(first, WatchdogReport::default());
    assert_eq!(second, WatchdogReport::default());
    assert!(w.ctx.store.is_empty().await.unwrap());
    assert_eq!(w.cp.calls("request_approval"), 1);
    let run = w.cp.run(10);
    assert_eq!(run.status, RunStatus::Pending);
    assert!(run.target_snapshot.approval_id.is_some());
}

#[tokio::test]
async fn one_failing_run_does_not_stop_the_sweep() {
    let cp = FakeControlPlane::new();
    cp.add_playbook(1, Some("- hosts: all\n"));
    cp.add_run(10, 1, vec![prod_host(1)]);
    cp.update_run(10, |r| r.created_at = Some(Utc::now() - Duration::minutes(10)));
    old_pending_run(&cp, 11);
    cp.state().refuse_approval = true;
    let w = worker(cp, SUCCEED).await;

    let report = Watchdog::new(&w.ctx)
        .sweep_project(DEFAULT_PROJECT_ID, Utc::now())
        .await
        .unwrap();

    assert_eq!(report.requeued, 1);
    assert_eq!(w.cp.status(10), RunStatus::Failed);
    assert_eq!(w.ctx.store.items().await.unwrap(), vec!["1:11".to_string()]);
}

#[tokio::test]
async fn rejecting_a_finished_run_leaves_it_alone() {
    let cp = FakeControlPlane::new();
    old_pending_run(&cp, 10);
    approval(&cp, 500, 10, ApprovalStatus::Rejected);
    cp.update_run(10, |r| r.status = RunStatus::Success);
    let w = worker(cp, SUCCEED).await;
    let run = w.cp.run(10);
    let rejected = w.cp.state().approvals[&500].clone();

    let decision = ApprovalGate::new(&w.ctx).on_decision(&run, &rejected).await.unwrap();

    assert_eq!(decision, Decision::Rejected);
    assert_eq!(w.cp.status(10), RunStatus::Success);
    assert_eq!(w.cp.calls("set_status"), 0);
    assert_eq!(w.cp.log(10), "");
}
