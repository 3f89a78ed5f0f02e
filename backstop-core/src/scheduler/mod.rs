/*!
Recurring backups.

The [`Scheduler`] keeps one timer task per enabled schedule, keyed by
schedule id. Registering a job for an id replaces and aborts whatever was
there, so edits racing each other never leave two timers for one schedule.
A fired run is spawned separately from its timer: stopping or replacing a
schedule never cancels a backup that is already running.
*/

pub mod cron;

pub use cron::{calculate_next_run, parse_time, Cadence, CronSpec};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditStatus};
use crate::metadata::{
    BackupOrigin, BackupSchedule, BackupType, Frequency, ScheduleRunStatus,
};
use crate::orchestrator::{BackupOrchestrator, BackupRequest, CleanupOptions, CleanupReport};
use crate::{BackstopError, Result};

/// Actor recorded on backups the scheduler triggers
pub const SCHEDULER_ACTOR: &str = "scheduler";

/// How late a run may be before the schedule counts as unhealthy
const OVERDUE_GRACE_MINUTES: i64 = 60;

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_backups() -> u32 {
    10
}

/// Fields needed to create a schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub frequency: Frequency,
    /// `HH:mm`, UTC
    pub time: String,
    #[serde(default)]
    pub day_of_week: Option<u8>,
    #[serde(default)]
    pub day_of_month: Option<u8>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_max_backups")]
    pub max_backups: u32,
    #[serde(default)]
    pub encrypt: Option<bool>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ScheduleRequest {
    pub fn new<S: Into<String>, T: Into<String>>(
        name: S,
        backup_type: BackupType,
        frequency: Frequency,
        time: T,
    ) -> Self {
        Self {
            name: name.into(),
            backup_type,
            frequency,
            time: time.into(),
            day_of_week: None,
            day_of_month: None,
            enabled: true,
            retention_days: default_retention_days(),
            max_backups: default_max_backups(),
            encrypt: None,
            description: None,
        }
    }

    fn into_schedule(self, now: DateTime<Utc>) -> BackupSchedule {
        BackupSchedule {
            id: format!("schedule_{}", Uuid::new_v4().simple()),
            name: self.name,
            backup_type: self.backup_type,
            frequency: self.frequency,
            time: self.time,
            day_of_week: self.day_of_week,
            day_of_month: self.day_of_month,
            enabled: self.enabled,
            retention_days: self.retention_days,
            max_backups: self.max_backups,
            encrypt: self.encrypt,
            description: self.description,
            last_run: None,
            next_run: None,
            last_status: None,
            last_backup_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial edit of a schedule; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub backup_type: Option<BackupType>,
    pub frequency: Option<Frequency>,
    pub time: Option<String>,
    pub day_of_week: Option<u8>,
    pub day_of_month: Option<u8>,
    pub enabled: Option<bool>,
    pub retention_days: Option<u32>,
    pub max_backups: Option<u32>,
    pub encrypt: Option<bool>,
    pub description: Option<String>,
}

impl ScheduleUpdate {
    fn apply(self, schedule: &mut BackupSchedule) {
        if let Some(name) = self.name {
            schedule.name = name;
        }
        if let Some(backup_type) = self.backup_type {
            schedule.backup_type = backup_type;
        }
        if let Some(frequency) = self.frequency {
            schedule.frequency = frequency;
        }
        if let Some(time) = self.time {
            schedule.time = time;
        }
        if self.day_of_week.is_some() {
            schedule.day_of_week = self.day_of_week;
        }
        if self.day_of_month.is_some() {
            schedule.day_of_month = self.day_of_month;
        }
        if let Some(enabled) = self.enabled {
            schedule.enabled = enabled;
        }
        if let Some(days) = self.retention_days {
            schedule.retention_days = days;
        }
        if let Some(max) = self.max_backups {
            schedule.max_backups = max;
        }
        if self.encrypt.is_some() {
            schedule.encrypt = self.encrypt;
        }
        if self.description.is_some() {
            schedule.description = self.description;
        }
    }
}

/// Result of one scheduled (or manually triggered) run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRunOutcome {
    pub schedule_id: String,
    pub status: ScheduleRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupReport>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    /// Schedules re-registered with a live job
    pub reloaded: usize,
    /// `schedule id: error` for schedules that could not be registered
    pub errors: Vec<String>,
    pub cleanup: CleanupReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleHealthEntry {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    /// A timer task exists for this schedule
    pub live: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<ScheduleRunStatus>,
    pub overdue: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleHealth {
    pub healthy: bool,
    pub total: usize,
    pub enabled: usize,
    pub live_jobs: usize,
    pub overdue: usize,
    pub failing: usize,
    pub schedules: Vec<ScheduleHealthEntry>,
}

struct LiveJob {
    handle: JoinHandle<()>,
    cron: String,
}

struct SchedulerInner {
    orchestrator: Arc<BackupOrchestrator>,
    jobs: DashMap<String, LiveJob>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        for job in self.jobs.iter() {
            job.handle.abort();
        }
    }
}

/// Registry of live schedule timers
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<BackupOrchestrator>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                orchestrator,
                jobs: DashMap::new(),
                maintenance: Mutex::new(None),
            }),
        }
    }

    pub fn orchestrator(&self) -> &Arc<BackupOrchestrator> {
        &self.inner.orchestrator
    }

    /// Register a timer for every enabled schedule in the store
    ///
    /// # Returns
    /// The number of live jobs registered
    pub async fn start(&self) -> Result<usize> {
        let (reloaded, errors) = self.reload().await?;
        for error in &errors {
            warn!(error = %error, "Schedule not registered");
        }
        info!(jobs = reloaded, "Scheduler started");
        Ok(reloaded)
    }

    async fn reload(&self) -> Result<(usize, Vec<String>)> {
        let store = self.inner.orchestrator.store();
        let now = Utc::now();
        let mut reloaded = 0;
        let mut errors = Vec::new();

        for mut schedule in store.list_schedules(true).await? {
            let spec = match CronSpec::from_schedule(&schedule) {
                Ok(spec) => spec,
                Err(e) => {
                    errors.push(format!("{}: {e}", schedule.id));
                    continue;
                }
            };
            let next_run = spec.next_after(now);
            if schedule.next_run != Some(next_run) {
                schedule.next_run = Some(next_run);
                if let Err(e) = store.update_schedule(&schedule).await {
                    warn!(schedule_id = %schedule.id, error = %e, "Failed to store next run");
                }
            }
            self.install(&schedule.id, spec);
            reloaded += 1;
        }
        Ok((reloaded, errors))
    }

    /// Spawn the timer for `schedule_id`, aborting any previous one
    fn install(&self, schedule_id: &str, spec: CronSpec) {
        let handle = spawn_timer(Arc::downgrade(&self.inner), schedule_id.to_string(), spec);
        let job = LiveJob {
            handle,
            cron: spec.expression(),
        };
        if let Some(previous) = self.inner.jobs.insert(schedule_id.to_string(), job) {
            previous.handle.abort();
        }
        debug!(schedule_id, cron = %spec, "Schedule registered");
    }

    /// Stop the live job for `schedule_id`; true if one existed
    fn stop(&self, schedule_id: &str) -> bool {
        match self.inner.jobs.remove(schedule_id) {
            Some((_, job)) => {
                job.handle.abort();
                true
            }
            None => false,
        }
    }

    fn stop_all(&self) {
        self.inner.jobs.retain(|_, job| {
            job.handle.abort();
            false
        });
    }

    /// Recompute `next_run`, persist, and (re)register when enabled
    async fn persist_and_register(&self, mut schedule: BackupSchedule) -> Result<BackupSchedule> {
        let spec = CronSpec::from_schedule(&schedule)?;
        let now = Utc::now();
        schedule.next_run = schedule.enabled.then(|| spec.next_after(now));
        schedule.updated_at = now;

        self.stop(&schedule.id);
        self.inner.orchestrator.store().update_schedule(&schedule).await?;
        if schedule.enabled {
            self.install(&schedule.id, spec);
        }
        Ok(schedule)
    }

    pub async fn create_schedule(
        &self,
        request: ScheduleRequest,
        actor: Option<&str>,
    ) -> Result<BackupSchedule> {
        let now = Utc::now();
        let mut schedule = request.into_schedule(now);
        schedule.validate()?;
        let spec = CronSpec::from_schedule(&schedule)?;
        schedule.next_run = schedule.enabled.then(|| spec.next_after(now));

        self.inner.orchestrator.store().insert_schedule(&schedule).await?;
        if schedule.enabled {
            self.install(&schedule.id, spec);
        }
        info!(schedule_id = %schedule.id, name = %schedule.name, cron = %spec, "Schedule created");
        self.audit("SCHEDULE_CREATE", actor, &schedule).await;
        Ok(schedule)
    }

    pub async fn update_schedule(
        &self,
        schedule_id: &str,
        update: ScheduleUpdate,
        actor: Option<&str>,
    ) -> Result<BackupSchedule> {
        let mut schedule = self.get_schedule(schedule_id).await?;
        update.apply(&mut schedule);
        schedule.validate()?;
        let schedule = self.persist_and_register(schedule).await?;
        info!(schedule_id, enabled = schedule.enabled, "Schedule updated");
        self.audit("SCHEDULE_UPDATE", actor, &schedule).await;
        Ok(schedule)
    }

    pub async fn toggle_schedule(
        &self,
        schedule_id: &str,
        enabled: bool,
        actor: Option<&str>,
    ) -> Result<BackupSchedule> {
        let mut schedule = self.get_schedule(schedule_id).await?;
        schedule.enabled = enabled;
        let schedule = self.persist_and_register(schedule).await?;
        info!(schedule_id, enabled, "Schedule toggled");
        self.audit("SCHEDULE_TOGGLE", actor, &schedule).await;
        Ok(schedule)
    }

    pub async fn delete_schedule(&self, schedule_id: &str, actor: Option<&str>) -> Result<()> {
        let schedule = self.get_schedule(schedule_id).await?;
        self.stop(schedule_id);
        if !self.inner.orchestrator.store().delete_schedule(schedule_id).await? {
            return Err(BackstopError::not_found(format!("Schedule {schedule_id}")));
        }
        info!(schedule_id, "Schedule deleted");
        self.audit("SCHEDULE_DELETE", actor, &schedule).await;
        Ok(())
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Result<BackupSchedule> {
        self.inner
            .orchestrator
            .store()
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| BackstopError::not_found(format!("Schedule {schedule_id}")))
    }

    pub async fn list_schedules(&self) -> Result<Vec<BackupSchedule>> {
        self.inner.orchestrator.store().list_schedules(false).await
    }

    /// Run `schedule_id` immediately, outside its timer
    pub async fn run_schedule_now(
        &self,
        schedule_id: &str,
        actor: Option<&str>,
    ) -> Result<ScheduleRunOutcome> {
        let schedule = self.get_schedule(schedule_id).await?;
        self.audit("SCHEDULE_RUN", actor, &schedule).await;
        self.inner.run_schedule(schedule_id).await
    }

    /// Whether a timer task exists for `schedule_id`
    pub fn is_live(&self, schedule_id: &str) -> bool {
        self.inner.jobs.contains_key(schedule_id)
    }

    pub fn live_job_count(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Stop every job, reload from the store, then run global retention
    /// cleanup
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        info!("Running scheduler maintenance");
        self.stop_all();
        let (reloaded, errors) = self.reload().await?;

        let defaults = self.inner.orchestrator.config().retention;
        let cleanup = match self
            .inner
            .orchestrator
            .cleanup_old_backups(&CleanupOptions::from(defaults))
            .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Global retention cleanup failed");
                CleanupReport {
                    deleted: Vec::new(),
                    errors: vec![crate::orchestrator::CleanupFailure {
                        backup_id: String::new(),
                        error: e.to_string(),
                    }],
                }
            }
        };

        info!(
            reloaded,
            errors = errors.len(),
            deleted = cleanup.deleted_count(),
            "Scheduler maintenance finished"
        );
        Ok(MaintenanceReport {
            reloaded,
            errors,
            cleanup,
        })
    }

    /// Run [`run_maintenance`](Self::run_maintenance) every `interval` until
    /// shutdown
    pub fn spawn_maintenance(&self, interval: std::time::Duration) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let scheduler = Scheduler { inner };
                if let Err(e) = scheduler.run_maintenance().await {
                    warn!(error = %e, "Scheduler maintenance failed");
                }
            }
        });
        if let Ok(mut slot) = self.inner.maintenance.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Per-schedule liveness and punctuality
    pub async fn get_schedule_health(&self) -> Result<ScheduleHealth> {
        let schedules = self.list_schedules().await?;
        let now = Utc::now();
        let grace = Duration::minutes(OVERDUE_GRACE_MINUTES);

        let entries: Vec<ScheduleHealthEntry> = schedules
            .iter()
            .map(|schedule| {
                let live = self.inner.jobs.get(&schedule.id).map(|job| job.cron.clone());
                let overdue = schedule.enabled
                    && schedule.next_run.is_some_and(|next| next + grace < now);
                ScheduleHealthEntry {
                    id: schedule.id.clone(),
                    name: schedule.name.clone(),
                    enabled: schedule.enabled,
                    live: live.is_some(),
                    cron: live.or_else(|| {
                        CronSpec::from_schedule(schedule).ok().map(|spec| spec.expression())
                    }),
                    next_run: schedule.next_run,
                    last_run: schedule.last_run,
                    last_status: schedule.last_status,
                    overdue,
                }
            })
            .collect();

        let enabled = entries.iter().filter(|e| e.enabled).count();
        let missing = entries.iter().filter(|e| e.enabled && !e.live).count();
        let overdue = entries.iter().filter(|e| e.overdue).count();
        let failing = entries
            .iter()
            .filter(|e| e.last_status == Some(ScheduleRunStatus::Failed))
            .count();

        Ok(ScheduleHealth {
            healthy: missing == 0 && overdue == 0,
            total: entries.len(),
            enabled,
            live_jobs: self.inner.jobs.len(),
            overdue,
            failing,
            schedules: entries,
        })
    }

    /// Abort every timer and the maintenance task
    pub fn shutdown(&self) {
        self.stop_all();
        if let Ok(mut slot) = self.inner.maintenance.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        info!("Scheduler stopped");
    }

    async fn audit(&self, action: &str, actor: Option<&str>, schedule: &BackupSchedule) {
        self.inner
            .orchestrator
            .audit(
                AuditEvent::new(action, AuditStatus::Success)
                    .with_context(json!({ "actor": actor, "scheduleId": schedule.id }))
                    .with_details(json!({
                        "name": schedule.name,
                        "type": schedule.backup_type,
                        "frequency": schedule.frequency,
                        "enabled": schedule.enabled,
                    })),
            )
            .await;
    }
}

impl SchedulerInner {
    /// Fire `schedule_id`: record the run, back up, record the outcome,
    /// then apply the schedule's retention
    async fn run_schedule(&self, schedule_id: &str) -> Result<ScheduleRunOutcome> {
        let store = self.orchestrator.store();
        let mut schedule = store
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| BackstopError::not_found(format!("Schedule {schedule_id}")))?;

        let started = Utc::now();
        schedule.last_run = Some(started);
        schedule.next_run = if schedule.enabled {
            Some(calculate_next_run(&schedule, started)?)
        } else {
            None
        };
        schedule.updated_at = started;
        store.update_schedule(&schedule).await?;
        info!(schedule_id, name = %schedule.name, "Running scheduled backup");

        let mut request = BackupRequest::new(schedule.backup_type)
            .with_description(format!("Scheduled backup: {}", schedule.name))
            .with_origin(BackupOrigin::Scheduled {
                schedule_id: schedule.id.clone(),
            });
        request.encrypt = schedule.encrypt;

        let (status, backup_id, error) = match self
            .orchestrator
            .create_backup(request, Some(SCHEDULER_ACTOR))
            .await
        {
            Ok(record) => (ScheduleRunStatus::Success, Some(record.backup_id), None),
            Err(e) => {
                let backup_id = match &e {
                    BackstopError::BackupFailed { backup_id, .. } => Some(backup_id.clone()),
                    _ => None,
                };
                warn!(schedule_id, error = %e, "Scheduled backup failed");
                (ScheduleRunStatus::Failed, backup_id, Some(e.to_string()))
            }
        };

        // Re-read: the schedule may have been edited or deleted meanwhile
        match store.get_schedule(schedule_id).await {
            Ok(Some(mut latest)) => {
                latest.last_status = Some(status);
                if backup_id.is_some() {
                    latest.last_backup_id = backup_id.clone();
                }
                latest.last_error = error.clone();
                latest.updated_at = Utc::now();
                if let Err(e) = store.update_schedule(&latest).await {
                    warn!(schedule_id, error = %e, "Failed to record schedule outcome");
                }
            }
            Ok(None) => debug!(schedule_id, "Schedule deleted during run"),
            Err(e) => warn!(schedule_id, error = %e, "Failed to reload schedule"),
        }

        let cleanup = match self
            .orchestrator
            .cleanup_old_backups(&CleanupOptions::for_schedule(&schedule))
            .await
        {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(schedule_id, error = %e, "Schedule retention cleanup failed");
                None
            }
        };

        Ok(ScheduleRunOutcome {
            schedule_id: schedule_id.to_string(),
            status,
            backup_id,
            error,
            next_run: schedule.next_run,
            cleanup,
        })
    }
}

/// Sleep until each firing of `spec`, spawning the run
fn spawn_timer(inner: Weak<SchedulerInner>, schedule_id: String, spec: CronSpec) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut next = spec.next_after(Utc::now());
        loop {
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            let Some(inner) = inner.upgrade() else { break };
            let id = schedule_id.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.run_schedule(&id).await {
                    warn!(schedule_id = %id, error = %e, "Scheduled run failed");
                }
            });
            next = spec.next_after(next.max(Utc::now()));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: ScheduleRequest = serde_json::from_value(json!({
            "name": "nightly",
            "type": "DATABASE",
            "frequency": "DAILY",
            "time": "02:00"
        }))
        .unwrap();
        assert!(request.enabled);
        assert_eq!(request.retention_days, 30);
        assert_eq!(request.max_backups, 10);

        let schedule = request.into_schedule(Utc::now());
        assert!(schedule.id.starts_with("schedule_"));
        assert!(schedule.validate().is_ok());
    }

    #[test]
    fn test_update_applies_only_given_fields() {
        let mut schedule =
            ScheduleRequest::new("weekly", BackupType::Files, Frequency::Weekly, "03:00")
                .into_schedule(Utc::now());
        schedule.day_of_week = Some(1);

        ScheduleUpdate {
            time: Some("04:30".into()),
            day_of_week: Some(5),
            ..ScheduleUpdate::default()
        }
        .apply(&mut schedule);

        assert_eq!(schedule.time, "04:30");
        assert_eq!(schedule.day_of_week, Some(5));
        assert_eq!(schedule.name, "weekly");
        assert_eq!(schedule.frequency, Frequency::Weekly);
    }
}
