//! Interval and cron schedules for playbooks.
//!
//! Each due instant has a deterministic key. Taking the schedule lock for
//! that key before creating the run is what makes a due instant fire at
//! most once, however many ticks or workers observe it.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use tracing::{debug, info, warn};

use fleet_core::types::{Playbook, ProjectId, RunRequest, Schedule, ScheduleKind};
use fleet_telemetry::metrics::{global_metrics, names};

use crate::approval::ApprovalGate;
use crate::context::WorkerContext;
use crate::keys;

pub const MIN_INTERVAL_SECS: i64 = 10;
pub const MAX_INTERVAL_SECS: i64 = 86_400;

/// Key of the due instant `schedule` has at `now`, or `None` if nothing is due.
///
/// Interval schedules bucket `now` into windows of the (clamped) interval
/// and are due when the last run is at least one interval old. Cron
/// schedules are due when their latest fire time at or before `now`
/// (minute resolution) is after the last run.
pub fn compute_due_key(schedule: &Schedule, now: DateTime<Utc>) -> Option<String> {
    match schedule.kind {
        ScheduleKind::Interval => interval_due_key(&schedule.value, schedule.last_run_at, now),
        ScheduleKind::Cron => cron_due_key(&schedule.value, schedule.last_run_at, now),
    }
}

fn interval_due_key(value: &str, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<String> {
    let secs = match value.trim().parse::<i64>() {
        Ok(secs) => secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS),
        Err(_) => {
            debug!(value, "invalid interval schedule");
            return None;
        }
    };
    if let Some(last) = last {
        if now - last < ChronoDuration::seconds(secs) {
            return None;
        }
    }
    Some(format!("i{}", now.timestamp().div_euclid(secs)))
}

fn cron_due_key(expr: &str, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<String> {
    let schedule = match parse_cron(expr) {
        Ok(schedule) => schedule,
        Err(e) => {
            debug!(expr, error = %e, "invalid cron schedule");
            return None;
        }
    };
    let minute = now.duration_trunc(ChronoDuration::minutes(1)).ok()?;
    let previous = schedule.after(&(minute + ChronoDuration::seconds(1))).next_back()?;
    if last.is_some_and(|last| previous <= last) {
        return None;
    }
    Some(previous.format("%Y%m%d%H%M").to_string())
}

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Accept classic five-field expressions. Seconds are pinned to zero and
/// numeric weekdays (0-7, Sunday is both 0 and 7) are rewritten as names,
/// since the `cron` crate numbers Sunday 1.
fn parse_cron(expr: &str) -> Result<cron::Schedule, cron::error::Error> {
    let expr = expr.trim();
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if let [minute, hour, day, month, weekday] = fields.as_slice() {
        let weekday = weekday.split(',').map(weekday_names).collect::<Vec<_>>().join(",");
        cron::Schedule::from_str(&format!("0 {minute} {hour} {day} {month} {weekday}"))
    } else {
        cron::Schedule::from_str(expr)
    }
}

/// `1-5` becomes `Mon,Tue,Wed,Thu,Fri`. Wildcards, names and anything
/// out of range pass through untouched.
fn weekday_names(item: &str) -> String {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => match step.parse::<usize>() {
            Ok(step) if step > 0 => (base, step),
            _ => return item.to_string(),
        },
        None => (item, 1),
    };
    let bounds = match base.split_once('-') {
        Some((lo, hi)) => lo.parse::<usize>().ok().zip(hi.parse::<usize>().ok()),
        None => base.parse::<usize>().ok().map(|n| (n, if step > 1 { 6 } else { n })),
    };
    let Some((lo, hi)) = bounds.filter(|(lo, hi)| lo <= hi && *hi <= 7) else {
        return item.to_string();
    };
    let mut names: Vec<&str> = Vec::new();
    for day in (lo..=hi).step_by(step) {
        let name = WEEKDAYS[day % 7];
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names.join(",")
}

pub struct Scheduler<'a> {
    ctx: &'a WorkerContext,
}

impl<'a> Scheduler<'a> {
    pub fn new(ctx: &'a WorkerContext) -> Self {
        Self { ctx }
    }

    /// Fire every due schedule of one project. Returns how many fired.
    pub async fn sweep_project(&self, project_id: ProjectId, now: DateTime<Utc>) -> Result<usize> {
        let playbooks = self
            .ctx
            .control_plane
            .list_playbooks(project_id)
            .await
            .with_context(|| format!("failed to list playbooks of project {project_id}"))?;

        let mut fired = 0;
        for playbook in &playbooks {
            let Some(schedule) = playbook.schedule.as_ref().filter(|s| s.enabled) else {
                continue;
            };
            let Some(due_key) = compute_due_key(schedule, now) else {
                continue;
            };
            let lock = keys::schedule_lock(project_id, playbook.id, &due_key);
            if !self.ctx.store.set_if_absent(&lock, keys::SCHEDULE_LOCK_TTL).await? {
                debug!(project_id, playbook_id = playbook.id, due_key, "due instant already handled");
                continue;
            }
            match self.fire(project_id, playbook, schedule, now).await {
                Ok(()) => fired += 1,
                Err(e) => warn!(
                    project_id,
                    playbook_id = playbook.id,
                    error = format!("{e:#}"),
                    "scheduled run failed"
                ),
            }
        }
        Ok(fired)
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut fired = 0;
        for project_id in self.ctx.projects().await {
            match self.sweep_project(project_id, now).await {
                Ok(n) => fired += n,
                Err(e) => warn!(project_id, error = format!("{e:#}"), "schedule sweep failed"),
            }
        }
        fired
    }

    async fn fire(&self, project_id: ProjectId, playbook: &Playbook, schedule: &Schedule, now: DateTime<Utc>) -> Result<()> {
        let cp = &self.ctx.control_plane;
        let request = RunRequest {
            host_ids: schedule.host_ids.clone(),
            group_ids: schedule.group_ids.clone(),
            extra_vars: schedule.extra_vars.clone(),
            dry_run: schedule.dry_run,
            rotation: None,
        };
        let run = cp
            .create_run(project_id, playbook.id, &request)
            .await
            .context("failed to create scheduled run")?;
        let gate = ApprovalGate::new(self.ctx).submit(&run, "scheduled run").await?;
        global_metrics().increment_counter(names::SCHEDULE_FIRES, &[]);
        info!(project_id, playbook_id = playbook.id, run_id = run.id, ?gate, "scheduled run created");

        let mut updated = schedule.clone();
        updated.last_run_at = Some(now);
        cp.update_playbook_schedule(project_id, playbook.id, &updated)
            .await
            .context("failed to record schedule last run")?;
        Ok(())
    }
}
