/*!
# Backstop Core Engine

Backup and restore orchestration for an application's relational database,
its file tree, or both together.

The engine provides:

- Three backup strategies (database dump, file-tree archive, full system)
  behind one [`BackupStrategy`](strategy::BackupStrategy) trait
- Optional AES-256-GCM encryption with Argon2 key derivation
- Format detection of existing artifacts, and restore routed by the result
- Offsite replication over a remote shell with retry and back-off
- Recurring schedules with retention cleanup
- Per-operation progress tracking with subscriber streams

## Architecture

[`BackupOrchestrator`] owns the lifecycle of every backup record: it creates
the record, runs the strategy, optionally replicates offsite and marks the
record COMPLETED or FAILED. Persistence is behind
[`MetadataStore`](store::MetadataStore), runtime policy behind
[`SettingsProvider`](settings::SettingsProvider) and audit trails behind
[`AuditSink`](audit::AuditSink), so each can be swapped independently.

## Usage

```rust,no_run
use std::sync::Arc;
use backstop_core::{
    BackupOrchestrator, BackupRequest, BackupType, EngineConfig, MemoryStore,
    StaticSettings, TracingAuditSink,
};

# async fn run() -> backstop_core::Result<()> {
let config = EngineConfig::new("/var/backups", "/srv/app");
let orchestrator = BackupOrchestrator::new(
    config,
    Arc::new(MemoryStore::new()),
    Arc::new(TracingAuditSink),
    Arc::new(StaticSettings::default()),
)?;

let record = orchestrator
    .create_backup(BackupRequest::new(BackupType::Files), Some("admin"))
    .await?;
println!("{} -> {}", record.backup_id, record.location.display());
# Ok(())
# }
```
*/

pub mod audit;
pub mod compression;
pub mod config;
pub mod detect;
pub mod disk;
pub mod encryption;
pub mod error;
pub mod metadata;
pub mod observability;
pub mod offsite;
pub mod orchestrator;
pub mod progress;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod strategy;


pub use audit::{AuditEvent, AuditSink, AuditStatus, MemoryAuditSink, TracingAuditSink};
pub use config::EngineConfig;
pub use detect::{DetectedType, RestoreDetector};
pub use encryption::EncryptionEngine;
pub use error::{BackstopError, Result};
pub use metadata::{BackupOrigin, BackupRecord, BackupSchedule, BackupStatus, BackupType, Frequency};
pub use observability::{gather_metrics, init_observability};
pub use offsite::OffsiteTransfer;
pub use orchestrator::{
    BackupOrchestrator, BackupRequest, BackupStats, CleanupOptions, CleanupReport, RestoreOutcome,
    RestoreRequest,
};
pub use progress::{ProgressHandle, ProgressTracker};
pub use scheduler::{ScheduleRequest, ScheduleUpdate, Scheduler};
pub use settings::{SettingsDocument, SettingsProvider, StaticSettings};
pub use store::{BackupFilter, JsonFileStore, MemoryStore, MetadataStore};
pub use strategy::{BackupStrategy, RestoreOptions};
