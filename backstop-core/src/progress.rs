/*!
Progress tracking for long-running backup and restore operations.

Each operation id owns an append-only event history and, while the
operation runs, a live broadcast stream. Stages follow a fixed order per
operation type; percentages never move backwards until the operation fails.
Finished histories are kept for a retention window and then evicted.
*/

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Capacity of each live stream; slow subscribers see `Lagged`
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Backup,
    Restore,
}

/// Named step of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Initiated,
    // backup
    DumpingDatabase,
    CollectingFiles,
    Compressing,
    Encrypting,
    TransferringOffsite,
    // restore
    DownloadingFromOffsite,
    Decrypting,
    Uncompressing,
    Validating,
    CreatingPreRestoreSnapshot,
    RestoringDatabase,
    RestoringFiles,
    // terminal
    Completed,
    Failed,
}

impl Stage {
    /// Percentage a stage starts at
    pub fn base_progress(self) -> u8 {
        match self {
            Stage::Initiated | Stage::Failed => 0,
            Stage::DumpingDatabase | Stage::DownloadingFromOffsite => 10,
            Stage::CollectingFiles | Stage::Decrypting => 20,
            Stage::Uncompressing => 30,
            Stage::Validating => 40,
            Stage::Compressing | Stage::CreatingPreRestoreSnapshot => 50,
            Stage::RestoringDatabase => 60,
            Stage::Encrypting => 70,
            Stage::TransferringOffsite | Stage::RestoringFiles => 80,
            Stage::Completed => 100,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }
}

/// One step reported for an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub operation_id: String,
    pub operation_type: OperationType,
    pub stage: Stage,
    /// 0-100
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct OperationState {
    operation_type: OperationType,
    history: Vec<ProgressEvent>,
    sender: Option<broadcast::Sender<ProgressEvent>>,
    finished_at: Option<Instant>,
}

impl OperationState {
    fn last_progress(&self) -> u8 {
        self.history.last().map(|e| e.progress).unwrap_or(0)
    }

    fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

#[derive(Debug)]
struct TrackerInner {
    operations: DashMap<String, OperationState>,
    retention: Duration,
    shutdown: watch::Sender<bool>,
}

/// Registry of operation progress
///
/// Cheap to clone; clones share the same registry.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl ProgressTracker {
    /// Create a tracker keeping finished histories for `retention`
    pub fn new(retention: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackerInner {
                operations: DashMap::new(),
                retention,
                shutdown,
            }),
        }
    }

    /// Register an operation and emit its INITIATED event
    ///
    /// Calling this again for a known id has no effect.
    pub fn create_tracker(&self, operation_id: &str, operation_type: OperationType) {
        let entry = self.inner.operations.entry(operation_id.to_string());
        if let dashmap::mapref::entry::Entry::Vacant(slot) = entry {
            let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
            let event = ProgressEvent {
                operation_id: operation_id.to_string(),
                operation_type,
                stage: Stage::Initiated,
                progress: 0,
                message: format!("{} initiated", operation_label(operation_type)),
                details: None,
                error: None,
                timestamp: Utc::now(),
            };
            slot.insert(OperationState {
                operation_type,
                history: vec![event],
                sender: Some(sender),
                finished_at: None,
            });
            tracing::debug!(operation_id, ?operation_type, "Progress tracker created");
        }
    }

    /// Append a progress event and publish it to live subscribers
    ///
    /// # Arguments
    /// * `progress` - Clamped to `[0, 100]` and raised to the last reported
    ///   value so the sequence never decreases
    ///
    /// # Returns
    /// The recorded event, or `None` if the operation is unknown or finished
    pub fn update_progress(
        &self,
        operation_id: &str,
        stage: Stage,
        progress: f64,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Option<ProgressEvent> {
        if stage.is_terminal() {
            return self.finish(operation_id, stage, message.into(), details, None);
        }

        let mut state = self.inner.operations.get_mut(operation_id)?;
        if state.is_finished() {
            tracing::debug!(operation_id, ?stage, "Ignoring progress after completion");
            return None;
        }

        let clamped = clamp_percent(progress).max(state.last_progress());
        let event = ProgressEvent {
            operation_id: operation_id.to_string(),
            operation_type: state.operation_type,
            stage,
            progress: clamped,
            message: message.into(),
            details,
            error: None,
            timestamp: Utc::now(),
        };
        state.history.push(event.clone());
        if let Some(sender) = &state.sender {
            // No receivers is fine
            let _ = sender.send(event.clone());
        }
        Some(event)
    }

    /// Report reaching `stage` at its base percentage
    pub fn advance(
        &self,
        operation_id: &str,
        stage: Stage,
        message: impl Into<String>,
    ) -> Option<ProgressEvent> {
        self.update_progress(operation_id, stage, stage.base_progress() as f64, message, None)
    }

    /// Emit the terminal event and close the live stream
    pub fn complete_tracker(
        &self,
        operation_id: &str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Option<ProgressEvent> {
        self.finish(operation_id, Stage::Completed, message.into(), details, None)
    }

    /// Emit FAILED with `error` and close the live stream
    pub fn fail_tracker(
        &self,
        operation_id: &str,
        error: impl Into<String>,
    ) -> Option<ProgressEvent> {
        let error = error.into();
        self.finish(
            operation_id,
            Stage::Failed,
            format!("Operation failed: {error}"),
            None,
            Some(error),
        )
    }

    fn finish(
        &self,
        operation_id: &str,
        stage: Stage,
        message: String,
        details: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Option<ProgressEvent> {
        let mut state = self.inner.operations.get_mut(operation_id)?;
        if state.is_finished() {
            return None;
        }

        let event = ProgressEvent {
            operation_id: operation_id.to_string(),
            operation_type: state.operation_type,
            stage,
            progress: stage.base_progress().max(state.last_progress()),
            message,
            details,
            error,
            timestamp: Utc::now(),
        };
        state.history.push(event.clone());
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(event.clone());
        }
        state.finished_at = Some(Instant::now());
        tracing::debug!(operation_id, ?stage, "Progress tracker finished");
        Some(event)
    }

    /// Subscribe to live events; `None` once the operation has finished
    pub fn subscribe(&self, operation_id: &str) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.inner
            .operations
            .get(operation_id)
            .and_then(|state| state.sender.as_ref().map(|s| s.subscribe()))
    }

    pub fn latest(&self, operation_id: &str) -> Option<ProgressEvent> {
        self.inner
            .operations
            .get(operation_id)
            .and_then(|state| state.history.last().cloned())
    }

    pub fn history(&self, operation_id: &str) -> Vec<ProgressEvent> {
        self.inner
            .operations
            .get(operation_id)
            .map(|state| state.history.clone())
            .unwrap_or_default()
    }

    /// Ids of operations that have not finished
    pub fn active_operations(&self) -> Vec<String> {
        self.inner
            .operations
            .iter()
            .filter(|e| !e.value().is_finished())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Drop finished histories older than the retention window
    pub fn evict_expired(&self) -> usize {
        let retention = self.inner.retention;
        let before = self.inner.operations.len();
        self.inner.operations.retain(|_, state| match state.finished_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
        let evicted = before.saturating_sub(self.inner.operations.len());
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted expired progress histories");
        }
        evicted
    }

    /// Run [`evict_expired`](Self::evict_expired) every `interval` until
    /// [`shutdown`](Self::shutdown)
    pub fn spawn_janitor(&self, interval: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        let mut stop = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracker.evict_expired();
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Stop any janitor task
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    /// Bind an operation id to this tracker for use by strategies
    pub fn handle(&self, operation_id: &str) -> ProgressHandle {
        ProgressHandle {
            tracker: Some(self.clone()),
            operation_id: operation_id.to_string(),
        }
    }
}

fn clamp_percent(progress: f64) -> u8 {
    if progress.is_nan() {
        return 0;
    }
    progress.round().clamp(0.0, 100.0) as u8
}

fn operation_label(operation_type: OperationType) -> &'static str {
    match operation_type {
        OperationType::Backup => "Backup",
        OperationType::Restore => "Restore",
    }
}

/// A tracker bound to one operation; detached handles report nothing
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    tracker: Option<ProgressTracker>,
    operation_id: String,
}

impl ProgressHandle {
    pub fn detached() -> Self {
        Self {
            tracker: None,
            operation_id: String::new(),
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn stage(&self, stage: Stage, message: impl Into<String>) {
        if let Some(tracker) = &self.tracker {
            tracker.advance(&self.operation_id, stage, message);
        }
    }

    pub fn report(&self, stage: Stage, progress: f64, message: impl Into<String>) {
        if let Some(tracker) = &self.tracker {
            tracker.update_progress(&self.operation_id, stage, progress, message, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_idempotent() {
        let tracker = ProgressTracker::default();
        tracker.create_tracker("op", OperationType::Backup);
        tracker.advance("op", Stage::DumpingDatabase, "dumping");
        tracker.create_tracker("op", OperationType::Backup);

        let history = tracker.history("op");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].stage, Stage::Initiated);
    }

    #[test]
    fn test_progress_is_clamped_and_monotonic() {
        let tracker = ProgressTracker::default();
        tracker.create_tracker("op", OperationType::Backup);

        let e = tracker
            .update_progress("op", Stage::Compressing, 250.0, "x", None)
            .unwrap();
        assert_eq!(e.progress, 100);

        let e = tracker
            .update_progress("op", Stage::Encrypting, 70.0, "y", None)
            .unwrap();
        assert_eq!(e.progress, 100);

        let e = tracker
            .update_progress("other", Stage::Encrypting, -5.0, "z", None);
        assert!(e.is_none());
    }

    #[test]
    fn test_updates_after_completion_are_ignored() {
        let tracker = ProgressTracker::default();
        tracker.create_tracker("op", OperationType::Restore);
        tracker.complete_tracker("op", "done", None).unwrap();

        assert!(tracker.advance("op", Stage::RestoringFiles, "late").is_none());
        assert!(tracker.fail_tracker("op", "late failure").is_none());
        assert_eq!(tracker.latest("op").unwrap().stage, Stage::Completed);
        assert!(tracker.subscribe("op").is_none());
    }

    #[tokio::test]
    async fn test_live_stream_closes_on_completion() {
        let tracker = ProgressTracker::default();
        tracker.create_tracker("op", OperationType::Backup);
        let mut rx = tracker.subscribe("op").unwrap();

        tracker.advance("op", Stage::CollectingFiles, "collecting");
        tracker.complete_tracker("op", "done", None);

        assert_eq!(rx.recv().await.unwrap().stage, Stage::CollectingFiles);
        assert_eq!(rx.recv().await.unwrap().stage, Stage::Completed);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn test_failure_records_error() {
        let tracker = ProgressTracker::default();
        tracker.create_tracker("op", OperationType::Backup);
        tracker.advance("op", Stage::Compressing, "compressing");
        let failed = tracker.fail_tracker("op", "disk full").unwrap();

        assert_eq!(failed.stage, Stage::Failed);
        assert_eq!(failed.progress, 50);
        assert_eq!(failed.error.as_deref(), Some("disk full"));
        assert!(tracker.active_operations().is_empty());
    }

    #[test]
    fn test_eviction_respects_retention() {
        let tracker = ProgressTracker::new(Duration::ZERO);
        tracker.create_tracker("done", OperationType::Backup);
        tracker.create_tracker("running", OperationType::Backup);
        tracker.complete_tracker("done", "ok", None);

        assert_eq!(tracker.evict_expired(), 1);
        assert!(tracker.history("done").is_empty());
        assert_eq!(tracker.history("running").len(), 1);
    }

    #[test]
    fn test_detached_handle_is_silent() {
        let handle = ProgressHandle::detached();
        handle.stage(Stage::Compressing, "nothing happens");
        handle.report(Stage::Compressing, 55.0, "still nothing");
    }
}
