/*!
Scheduler lifecycle: registration of live jobs, manual runs with retention,
maintenance reloads and health reporting.
*/

#![cfg(unix)]

mod common;

use chrono::{Duration, Utc};

use backstop_core::metadata::{BackupOrigin, Frequency, ScheduleRunStatus};
use backstop_core::{
    BackstopError, BackupFilter, BackupSchedule, BackupType, MetadataStore, ScheduleRequest,
    ScheduleUpdate, Scheduler,
};
use common::{failing_dump, Fixture};

fn nightly(backup_type: BackupType) -> ScheduleRequest {
    ScheduleRequest::new("nightly", backup_type, Frequency::Daily, "02:00")
}

#[tokio::test]
async fn test_create_registers_live_job() {
    let fx = Fixture::new();
    let scheduler = Scheduler::new(fx.orchestrator.clone());

    let schedule = scheduler
        .create_schedule(nightly(BackupType::Files), Some("admin"))
        .await
        .unwrap();

    assert!(schedule.id.starts_with("schedule_"));
    assert!(scheduler.is_live(&schedule.id));
    assert!(schedule.next_run.unwrap() > Utc::now());
    assert_eq!(scheduler.list_schedules().await.unwrap().len(), 1);
    assert!(fx
        .audit_actions()
        .contains(&"SCHEDULE_CREATE:Success".to_string()));
    scheduler.shutdown();
}

#[tokio::test]
async fn test_disabled_schedule_has_no_job() {
    let fx = Fixture::new();
    let scheduler = Scheduler::new(fx.orchestrator.clone());
    let mut request = nightly(BackupType::Files);
    request.enabled = false;

    let schedule = scheduler.create_schedule(request, None).await.unwrap();
    assert!(!scheduler.is_live(&schedule.id));
    assert!(schedule.next_run.is_none());
}

#[tokio::test]
async fn test_invalid_timing_is_rejected() {
    let fx = Fixture::new();
    let scheduler = Scheduler::new(fx.orchestrator.clone());

    let weekly = ScheduleRequest::new("weekly", BackupType::Database, Frequency::Weekly, "02:00");
    assert!(matches!(
        scheduler.create_schedule(weekly, None).await,
        Err(BackstopError::Validation(_))
    ));

    let bad_time = ScheduleRequest::new("late", BackupType::Database, Frequency::Daily, "25:00");
    assert!(scheduler.create_schedule(bad_time, None).await.is_err());

    assert!(scheduler.list_schedules().await.unwrap().is_empty());
    assert_eq!(scheduler.live_job_count(), 0);
}

#[tokio::test]
async fn test_toggle_update_and_delete() {
    let fx = Fixture::new();
    let scheduler = Scheduler::new(fx.orchestrator.clone());
    let schedule = scheduler
        .create_schedule(nightly(BackupType::Database), None)
        .await
        .unwrap();

    let off = scheduler.toggle_schedule(&schedule.id, false, None).await.unwrap();
    assert!(!off.enabled);
    assert!(off.next_run.is_none());
    assert!(!scheduler.is_live(&schedule.id));

    let on = scheduler.toggle_schedule(&schedule.id, true, None).await.unwrap();
    assert!(on.next_run.is_some());
    assert!(scheduler.is_live(&schedule.id));

    let weekly = scheduler
        .update_schedule(
            &schedule.id,
            ScheduleUpdate {
                frequency: Some(Frequency::Weekly),
                day_of_week: Some(3),
                time: Some("04:15".into()),
                ..ScheduleUpdate::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(weekly.frequency, Frequency::Weekly);
    assert_eq!(weekly.next_run.unwrap().format("%H:%M").to_string(), "04:15");

    let health = scheduler.get_schedule_health().await.unwrap();
    assert_eq!(health.schedules[0].cron.as_deref(), Some("15 4 * * 3"));

    // A failed edit leaves the stored schedule and its job untouched
    let broken = scheduler
        .update_schedule(
            &schedule.id,
            ScheduleUpdate {
                frequency: Some(Frequency::Monthly),
                ..ScheduleUpdate::default()
            },
            None,
        )
        .await;
    assert!(broken.is_err());
    assert_eq!(
        scheduler.get_schedule(&schedule.id).await.unwrap().frequency,
        Frequency::Weekly
    );
    assert!(scheduler.is_live(&schedule.id));

    scheduler.delete_schedule(&schedule.id, Some("admin")).await.unwrap();
    assert!(!scheduler.is_live(&schedule.id));
    assert!(matches!(
        scheduler.get_schedule(&schedule.id).await,
        Err(BackstopError::NotFound(_))
    ));
    assert!(matches!(
        scheduler.delete_schedule(&schedule.id, None).await,
        Err(BackstopError::NotFound(_))
    ));

    let actions = fx.audit_actions();
    for action in ["SCHEDULE_TOGGLE", "SCHEDULE_UPDATE", "SCHEDULE_DELETE"] {
        assert!(actions.contains(&format!("{action}:Success")), "{action}");
    }
}

#[tokio::test]
async fn test_run_now_records_outcome_and_applies_retention() {
    let fx = Fixture::new();
    let scheduler = Scheduler::new(fx.orchestrator.clone());
    let mut request = nightly(BackupType::Files);
    request.max_backups = 1;
    let schedule = scheduler.create_schedule(request, None).await.unwrap();

    let first = scheduler.run_schedule_now(&schedule.id, None).await.unwrap();
    assert_eq!(first.status, ScheduleRunStatus::Success);
    let first_id = first.backup_id.unwrap();
    let record = fx.orchestrator.get_backup(&first_id).await.unwrap();
    assert_eq!(
        record.origin,
        BackupOrigin::Scheduled {
            schedule_id: schedule.id.clone()
        }
    );
    assert_eq!(record.created_by.as_deref(), Some("scheduler"));
    assert_eq!(record.description.as_deref(), Some("Scheduled backup: nightly"));

    let second = scheduler.run_schedule_now(&schedule.id, None).await.unwrap();
    let second_id = second.backup_id.unwrap();
    let cleanup = second.cleanup.unwrap();
    assert_eq!(cleanup.deleted.len(), 1);

    let remaining = fx
        .orchestrator
        .list_backups(&BackupFilter::completed().for_schedule(schedule.id.clone()))
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].backup_id == first_id || remaining[0].backup_id == second_id);

    let stored = scheduler.get_schedule(&schedule.id).await.unwrap();
    assert_eq!(stored.last_status, Some(ScheduleRunStatus::Success));
    assert_eq!(stored.last_backup_id.as_deref(), Some(second_id.as_str()));
    assert!(stored.last_run.is_some());
    assert!(stored.last_error.is_none());
    scheduler.shutdown();
}

#[tokio::test]
async fn test_run_now_failure_is_recorded() {
    let fx = Fixture::with_config(|config| {
        let bin = config.database.dump_program.parent().unwrap().to_path_buf();
        config.database.dump_program = failing_dump(&bin, "database is down");
    });
    let scheduler = Scheduler::new(fx.orchestrator.clone());
    let schedule = scheduler
        .create_schedule(nightly(BackupType::Database), None)
        .await
        .unwrap();

    let outcome = scheduler.run_schedule_now(&schedule.id, None).await.unwrap();
    assert_eq!(outcome.status, ScheduleRunStatus::Failed);
    assert!(outcome.error.unwrap().contains("database is down"));

    let stored = scheduler.get_schedule(&schedule.id).await.unwrap();
    assert_eq!(stored.last_status, Some(ScheduleRunStatus::Failed));
    assert_eq!(stored.last_backup_id, outcome.backup_id);
    assert!(stored.last_error.is_some());

    let health = scheduler.get_schedule_health().await.unwrap();
    assert_eq!(health.failing, 1);
    scheduler.shutdown();
}

#[tokio::test]
async fn test_start_recovers_stored_schedules() {
    let fx = Fixture::new();
    let now = Utc::now();
    let stale = BackupSchedule {
        id: "schedule_stale".into(),
        name: "weekly files".into(),
        backup_type: BackupType::Files,
        frequency: Frequency::Weekly,
        time: "03:00".into(),
        day_of_week: Some(0),
        day_of_month: None,
        enabled: true,
        retention_days: 30,
        max_backups: 10,
        encrypt: None,
        description: None,
        last_run: None,
        next_run: Some(now - Duration::hours(3)),
        last_status: None,
        last_backup_id: None,
        last_error: None,
        created_at: now - Duration::days(10),
        updated_at: now - Duration::days(10),
    };
    fx.store.insert_schedule(&stale).await.unwrap();

    let scheduler = Scheduler::new(fx.orchestrator.clone());
    let health = scheduler.get_schedule_health().await.unwrap();
    assert!(!health.healthy);
    assert_eq!(health.overdue, 1);
    assert!(!health.schedules[0].live);

    assert_eq!(scheduler.start().await.unwrap(), 1);
    let health = scheduler.get_schedule_health().await.unwrap();
    assert!(health.healthy);
    assert_eq!(health.live_jobs, 1);
    let next = scheduler.get_schedule("schedule_stale").await.unwrap().next_run.unwrap();
    assert!(next > Utc::now());

    let report = scheduler.run_maintenance().await.unwrap();
    assert_eq!(report.reloaded, 1);
    assert!(report.errors.is_empty());
    assert!(scheduler.is_live("schedule_stale"));

    scheduler.shutdown();
    assert_eq!(scheduler.live_job_count(), 0);
}
