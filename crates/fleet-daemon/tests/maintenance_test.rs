mod common;

use chrono::{Duration, Utc};

use common::{worker, FakeControlPlane, SUCCEED};
use fleet_core::types::{SecretLease, DEFAULT_PROJECT_ID};
use fleet_daemon::leases::LeaseReaper;
use fleet_daemon::recompute;

#[tokio::test]
async fn expired_leases_are_revoked() {
    let cp = FakeControlPlane::new();
    let now = Utc::now();
    let lease = |id: i64, expires_in: i64| SecretLease {
        id,
        secret_id: 20,
        issued_by: None,
        issued_at: now - Duration::hours(1),
        expires_at: now + Duration::seconds(expires_in),
        revoked_at: None,
    };
    cp.state().leases = vec![lease(1, -60), lease(2, 600), lease(3, -1)];
    let mut already = lease(4, -3600);
    already.revoked_at = Some(now - Duration::minutes(30));
    cp.state().leases.push(already);
    let w = worker(cp, SUCCEED).await;
    let reaper = LeaseReaper::new(&w.ctx);

    assert_eq!(reaper.sweep(now).await, 2);
    assert_eq!(reaper.sweep(now).await, 0);
    assert_eq!(w.cp.state().revoked_leases, vec![1, 3]);
}

#[tokio::test]
async fn recompute_covers_every_project() {
    let w = worker(FakeControlPlane::new(), SUCCEED).await;

    assert_eq!(recompute::sweep(&w.ctx).await, 1);
    assert_eq!(w.cp.state().recomputed, vec![DEFAULT_PROJECT_ID]);
}
