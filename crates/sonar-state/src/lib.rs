//! Run-state stores and the stage transition authority for Sonar.
//!
//! Owns the manifest and gates documents (optimistic revisions + audit),
//! the per-run lease lock with its heartbeat, the watchdog, and the
//! tick/telemetry ledgers.

pub mod gates;
pub mod manifest;
pub mod run_lock;
pub mod stage;
pub mod stage_advance;
pub mod telemetry;
pub mod watchdog;

pub use gates::{
    gates_write, load_gates, write_initial_gates, GateId, GateRecord, GateStatus, GateUpdate,
    GatesDocument, ALL_GATES, GATES_FILE, GATES_SCHEMA_VERSION,
};
pub use manifest::{
    load_manifest, manifest_write, mark_run_failed, record_failure, retry_record,
    validate_manifest, write_initial_manifest, ArtifactIndex, FailureRecord, ManifestMetrics,
    QueryMode, QuerySpec, RetryHistoryEntry, RetryRecordOutcome, RunLimits, RunManifest,
    RunStatus, Sensitivity, StageHistoryEntry, StageState, MANIFEST_FILE,
    MANIFEST_SCHEMA_VERSION,
};
pub use run_lock::{
    acquire_run_lock, RunLockDocument, RunLockHandle, RunLockRequest, RUN_LOCK_FILE,
    RUN_LOCK_SCHEMA_VERSION,
};
pub use stage::{StageId, ALL_STAGES};
pub use stage_advance::{stage_advance, StageAdvanceOutcome, StageAdvanceRequest};
pub use telemetry::{
    append_telemetry_event, append_tick_entry, next_tick_index, run_metrics_build,
    run_metrics_write, RunMetricsDocument, StageDuration, TelemetryEvent, TickLedgerEntry,
    RUN_METRICS_FILE, TELEMETRY_LEDGER_FILE, TICKS_LEDGER_FILE,
};
pub use watchdog::{watchdog_check, WatchdogReport, WatchdogRequest, TIMEOUT_CHECKPOINT_FILE};
