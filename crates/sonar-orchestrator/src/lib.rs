//! The Sonar orchestrator: run bootstrap, the idempotent tick executor,
//! bounded run loops, drivers, and operator halt files.
//!
//! A tick acquires the run lock, checks run status, produces the current
//! stage's artifacts through the configured driver, computes the stage's
//! gates, and delegates the transition to `stage_advance`. Typed blocks
//! surface to the caller unchanged.

pub mod bootstrap;
pub mod driver;
pub mod halt;
pub mod run;
pub mod tick;

pub use bootstrap::{load_scope, run_init, RunInitRequest, ScopeDocument, SCOPE_FILE, SCOPE_SCHEMA_VERSION};
pub use driver::{AgentDriver, AgentReply, AgentRequest, DriverConfig, FixtureDriver};
pub use halt::{write_halt_files, MissingPerspective, HALT_DIR, HALT_LATEST_FILE, HALT_SCHEMA_VERSION};
pub use run::{
    orchestrator_run, orchestrator_tick_fixture, orchestrator_tick_live,
    orchestrator_tick_post_pivot, orchestrator_tick_post_summaries, RunLoopOutcome,
    RunLoopRequest, DEFAULT_LEASE_SECONDS,
};
pub use tick::{
    orchestrator_tick, write_fallback_summary, TickOutcome, TickRequest, CITATION_FIXTURES_FILE,
    DEFAULT_WAVE_RETRIES, FALLBACK_SUMMARY_FILE, OPERATOR_REVIEW_BUNDLE_FILE, RUN_CONFIG_FILE,
};
