use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sonar_core::{
    append_audit_record, format_iso, parse_iso, write_text_atomic, AuditRecord, EngineError,
    EngineResult, ErrorCode,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Schema tag carried by the lock file.
pub const RUN_LOCK_SCHEMA_VERSION: &str = "run_lock.v1";
/// Lock file location inside a run root.
pub const RUN_LOCK_FILE: &str = "logs/run.lock";

fn run_lock_schema_version() -> String {
    RUN_LOCK_SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// On-disk lease describing the current lock holder.
pub struct RunLockDocument {
    #[serde(default = "run_lock_schema_version")]
    pub schema_version: String,
    pub acquired_at: String,
    pub expires_at: String,
    pub reason: String,
    pub holder_id: String,
}

/// Inputs for one lock acquisition.
#[derive(Debug, Clone)]
pub struct RunLockRequest<'a> {
    pub run_root: &'a Path,
    pub run_id: &'a str,
    pub lease_seconds: u64,
    pub reason: &'a str,
    pub holder_id: &'a str,
    pub now_iso: &'a str,
}

#[derive(Debug)]
struct HeartbeatTask {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Exclusive mutator handle for one run root.
///
/// The heartbeat task is owned by the handle and torn down on release;
/// on a crash the lease simply expires and the next acquirer steals it.
#[derive(Debug)]
pub struct RunLockHandle {
    lock_path: PathBuf,
    holder_id: String,
    reason: String,
    heartbeat: Option<HeartbeatTask>,
    released: bool,
}

/// Acquires the per-run mutator lock.
///
/// Creation is atomic (`O_CREAT|O_EXCL`); an unexpired lease from another
/// holder returns `LOCK_HELD`, an expired lease is stolen and audited.
pub fn acquire_run_lock(request: &RunLockRequest<'_>) -> EngineResult<RunLockHandle> {
    let now = parse_iso(request.now_iso).map_err(EngineError::from)?;
    let lock_path = request.run_root.join(RUN_LOCK_FILE);
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent).map_err(|error| {
            EngineError::new(
                ErrorCode::Internal,
                format!("failed to create {}: {error}", parent.display()),
            )
        })?;
    }

    let document = lock_document(request, now);
    let created = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path);
    match created {
        Ok(mut file) => {
            let text = lock_text(&document)?;
            file.write_all(text.as_bytes()).and_then(|()| file.sync_all()).map_err(|error| {
                EngineError::new(
                    ErrorCode::Internal,
                    format!("failed to write lock {}: {error}", lock_path.display()),
                )
            })?;
        }
        Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
            let existing: RunLockDocument = sonar_core::read_json_document(&lock_path)?;
            let expires = parse_iso(&existing.expires_at).map_err(EngineError::from)?;
            if expires > now {
                return Err(EngineError::new(
                    ErrorCode::LockHeld,
                    format!("run lock is held by {}", existing.holder_id),
                )
                .with_details(json!({
                    "holder_id": existing.holder_id,
                    "expires_at": existing.expires_at,
                })));
            }
            // Stale lease: steal it and leave an audit trail.
            write_text_atomic(&lock_path, &lock_text(&document)?).map_err(EngineError::from)?;
            let record = AuditRecord::for_action(
                "lock_stolen",
                format!(
                    "stale lease from {} expired {}",
                    existing.holder_id, existing.expires_at
                ),
                request.now_iso,
                request.run_id,
            );
            append_audit_record(request.run_root, &record).map_err(EngineError::from)?;
            let _ = crate::telemetry::append_telemetry_event(
                request.run_root,
                &crate::telemetry::TelemetryEvent {
                    ts: request.now_iso.to_string(),
                    event: "lock_stolen".to_string(),
                    stage: None,
                    details: json!({ "previous_holder": existing.holder_id.clone() }),
                },
            );
            tracing::warn!(
                run_id = %request.run_id,
                previous_holder = %existing.holder_id,
                "stale run lock stolen"
            );
        }
        Err(error) => {
            return Err(EngineError::new(
                ErrorCode::Internal,
                format!("failed to create lock {}: {error}", lock_path.display()),
            ));
        }
    }

    Ok(RunLockHandle {
        lock_path,
        holder_id: request.holder_id.to_string(),
        reason: request.reason.to_string(),
        heartbeat: None,
        released: false,
    })
}

fn lock_document(request: &RunLockRequest<'_>, now: DateTime<Utc>) -> RunLockDocument {
    RunLockDocument {
        schema_version: run_lock_schema_version(),
        acquired_at: format_iso(now),
        expires_at: format_iso(now + chrono::Duration::seconds(request.lease_seconds as i64)),
        reason: request.reason.to_string(),
        holder_id: request.holder_id.to_string(),
    }
}

fn lock_text(document: &RunLockDocument) -> EngineResult<String> {
    let value = serde_json::to_value(document).map_err(|error| {
        EngineError::new(ErrorCode::Internal, format!("failed to encode lock: {error}"))
    })?;
    Ok(sonar_core::json_store::canonical_document_text(&value))
}

impl RunLockHandle {
    /// Extends the lease; refuses when the file now names another holder.
    pub fn refresh(&self, lease_seconds: u64, now_iso: &str) -> EngineResult<()> {
        let now = parse_iso(now_iso).map_err(EngineError::from)?;
        let current: RunLockDocument = sonar_core::read_json_document(&self.lock_path)?;
        if current.holder_id != self.holder_id {
            return Err(EngineError::new(
                ErrorCode::LockHeld,
                format!("run lock was taken over by {}", current.holder_id),
            )
            .with_details(json!({ "holder_id": current.holder_id })));
        }
        let refreshed = RunLockDocument {
            expires_at: format_iso(now + chrono::Duration::seconds(lease_seconds as i64)),
            reason: self.reason.clone(),
            ..current
        };
        write_text_atomic(&self.lock_path, &lock_text(&refreshed)?).map_err(EngineError::from)
    }

    /// Starts the cooperative heartbeat that refreshes the lease until
    /// release. The timer is owned by this handle; dropping the handle
    /// tears it down.
    pub fn start_heartbeat(&mut self, interval_ms: u64, lease_seconds: u64) {
        self.stop_heartbeat();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let lock_path = self.lock_path.clone();
        let holder_id = self.holder_id.clone();
        let reason = self.reason.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        let refreshed = sonar_core::read_json_document::<RunLockDocument>(&lock_path)
                            .ok()
                            .filter(|current| current.holder_id == holder_id)
                            .map(|current| RunLockDocument {
                                expires_at: format_iso(
                                    now + chrono::Duration::seconds(lease_seconds as i64),
                                ),
                                reason: reason.clone(),
                                ..current
                            });
                        let Some(refreshed) = refreshed else { break };
                        let Ok(text) = lock_text(&refreshed) else { break };
                        if write_text_atomic(&lock_path, &text).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        self.heartbeat = Some(HeartbeatTask {
            shutdown: shutdown_tx,
            task,
        });
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.shutdown.send(());
            heartbeat.task.abort();
        }
    }

    /// Releases the lock, removing the file when this handle still holds
    /// it.
    pub fn release(mut self) -> EngineResult<()> {
        self.stop_heartbeat();
        self.released = true;
        match sonar_core::read_json_document::<RunLockDocument>(&self.lock_path) {
            Ok(current) if current.holder_id == self.holder_id => {
                std::fs::remove_file(&self.lock_path).map_err(|error| {
                    EngineError::new(
                        ErrorCode::Internal,
                        format!("failed to remove lock {}: {error}", self.lock_path.display()),
                    )
                })
            }
            _ => Ok(()),
        }
    }
}

impl Drop for RunLockHandle {
    fn drop(&mut self) {
        self.stop_heartbeat();
        if !self.released {
            if let Ok(current) =
                sonar_core::read_json_document::<RunLockDocument>(&self.lock_path)
            {
                if current.holder_id == self.holder_id {
                    let _ = std::fs::remove_file(&self.lock_path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use sonar_core::ErrorCode;

    use super::{acquire_run_lock, RunLockDocument, RunLockRequest};

    const NOW: &str = "2026-03-01T10:00:00Z";
    const LATER: &str = "2026-03-01T10:02:00Z";

    fn request<'a>(
        run_root: &'a std::path::Path,
        holder_id: &'a str,
        now_iso: &'a str,
    ) -> RunLockRequest<'a> {
        RunLockRequest {
            run_root,
            run_id: "run-001",
            lease_seconds: 60,
            reason: "tick",
            holder_id,
            now_iso,
        }
    }

    #[test]
    fn functional_lock_round_trip_creates_and_releases() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let handle = acquire_run_lock(&request(tempdir.path(), "holder-a", NOW))
            .expect("acquire should succeed");
        let lock_path = tempdir.path().join("logs/run.lock");
        let document: RunLockDocument =
            sonar_core::read_json_document(&lock_path).expect("lock doc");
        assert_eq!(document.holder_id, "holder-a");
        assert_eq!(document.expires_at, "2026-03-01T10:01:00Z");
        handle.release().expect("release should succeed");
        assert!(!lock_path.exists());
    }

    #[test]
    fn regression_live_lease_blocks_second_acquirer() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let _handle = acquire_run_lock(&request(tempdir.path(), "holder-a", NOW))
            .expect("first acquire");
        let error = acquire_run_lock(&request(tempdir.path(), "holder-b", NOW))
            .expect_err("second acquire should fail");
        assert_eq!(error.code, ErrorCode::LockHeld);
        assert_eq!(error.details["holder_id"], serde_json::json!("holder-a"));
    }

    #[test]
    fn functional_stale_lease_is_stolen_with_audit() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let first = acquire_run_lock(&request(tempdir.path(), "holder-a", NOW))
            .expect("first acquire");
        // Keep the file on disk while the lease expires.
        std::mem::forget(first);
        let second = acquire_run_lock(&request(tempdir.path(), "holder-b", LATER))
            .expect("stale lease should be stolen");
        let document: RunLockDocument =
            sonar_core::read_json_document(&tempdir.path().join("logs/run.lock"))
                .expect("lock doc");
        assert_eq!(document.holder_id, "holder-b");
        let audit = std::fs::read_to_string(tempdir.path().join("logs/audit.jsonl"))
            .expect("audit ledger");
        assert!(audit.contains("lock_stolen"));
        second.release().expect("release");
    }

    #[test]
    fn functional_refresh_extends_the_lease() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let handle = acquire_run_lock(&request(tempdir.path(), "holder-a", NOW))
            .expect("acquire");
        handle.refresh(300, NOW).expect("refresh should succeed");
        let document: RunLockDocument =
            sonar_core::read_json_document(&tempdir.path().join("logs/run.lock"))
                .expect("lock doc");
        assert_eq!(document.expires_at, "2026-03-01T10:05:00Z");
        handle.release().expect("release");
    }

    #[tokio::test]
    async fn integration_heartbeat_keeps_lease_fresh() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let mut handle = acquire_run_lock(&request(tempdir.path(), "holder-a", NOW))
            .expect("acquire");
        handle.start_heartbeat(10, 120);
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        let document: RunLockDocument =
            sonar_core::read_json_document(&tempdir.path().join("logs/run.lock"))
                .expect("lock doc");
        // The heartbeat rewrites expires_at from the wall clock, far past
        // the pinned acquisition lease.
        assert!(document.expires_at > "2026-04-01T00:00:00Z".to_string());
        handle.release().expect("release");
    }
}
