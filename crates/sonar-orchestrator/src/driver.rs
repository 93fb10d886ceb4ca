use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

/// One agent invocation as handed to a driver.
///
/// Drivers never touch the run root: the prompt arrives as content and
/// the markdown comes back in the reply.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentRequest {
    pub run_id: String,
    pub stage: String,
    pub perspective_id: String,
    pub agent_type: String,
    pub output_md: String,
    pub prompt_md: String,
    pub prompt_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Driver reply: the produced markdown document.
pub struct AgentReply {
    pub markdown: String,
}

#[async_trait]
/// Trait contract for `AgentDriver` behavior.
pub trait AgentDriver: Send + Sync {
    async fn run_agent(&self, request: &AgentRequest) -> Result<AgentReply>;
}

/// How the orchestrator obtains agent markdown.
#[derive(Clone)]
pub enum DriverConfig {
    /// Pre-made outputs on disk; used by tests and replays.
    Fixture(PathBuf),
    /// A live callback driver.
    Live(Arc<dyn AgentDriver>),
    /// An external operator agent: the tick halts with
    /// `RUN_AGENT_REQUIRED` and lists the missing perspectives.
    Task,
}

impl std::fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixture(dir) => f.debug_tuple("Fixture").field(dir).finish(),
            Self::Live(_) => f.write_str("Live(..)"),
            Self::Task => f.write_str("Task"),
        }
    }
}

/// Reads `<fixtures>/<stage>/<perspective>.md`, returning identical
/// content for identical requests.
pub struct FixtureDriver {
    fixtures_dir: PathBuf,
}

impl FixtureDriver {
    /// Builds a fixture driver rooted at the given directory.
    pub fn new(fixtures_dir: impl Into<PathBuf>) -> Self {
        Self {
            fixtures_dir: fixtures_dir.into(),
        }
    }
}

#[async_trait]
impl AgentDriver for FixtureDriver {
    async fn run_agent(&self, request: &AgentRequest) -> Result<AgentReply> {
        let path = self
            .fixtures_dir
            .join(&request.stage)
            .join(format!("{}.md", request.perspective_id));
        let markdown = std::fs::read_to_string(&path)
            .with_context(|| format!("fixture output {} is missing", path.display()))?;
        Ok(AgentReply { markdown })
    }
}
