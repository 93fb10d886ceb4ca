use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The eleven positions of the run lifecycle graph.
pub enum StageId {
    Init,
    Perspectives,
    Wave1,
    Pivot,
    Wave2,
    Citations,
    Summaries,
    Synthesis,
    Review,
    Finalize,
    Complete,
}

/// All stages in lifecycle order.
pub const ALL_STAGES: [StageId; 11] = [
    StageId::Init,
    StageId::Perspectives,
    StageId::Wave1,
    StageId::Pivot,
    StageId::Wave2,
    StageId::Citations,
    StageId::Summaries,
    StageId::Synthesis,
    StageId::Review,
    StageId::Finalize,
    StageId::Complete,
];

impl StageId {
    /// Returns the wire form of the stage id.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Perspectives => "perspectives",
            Self::Wave1 => "wave1",
            Self::Pivot => "pivot",
            Self::Wave2 => "wave2",
            Self::Citations => "citations",
            Self::Summaries => "summaries",
            Self::Synthesis => "synthesis",
            Self::Review => "review",
            Self::Finalize => "finalize",
            Self::Complete => "complete",
        }
    }

    /// Parses a wire-form stage id.
    pub fn parse(raw: &str) -> Option<Self> {
        ALL_STAGES.iter().copied().find(|stage| stage.as_str() == raw)
    }

    /// Returns the legal transition targets out of this stage.
    pub fn candidates(self) -> &'static [StageId] {
        match self {
            Self::Init => &[StageId::Wave1, StageId::Perspectives],
            Self::Perspectives => &[StageId::Wave1],
            Self::Wave1 => &[StageId::Pivot],
            Self::Pivot => &[StageId::Wave2, StageId::Citations],
            Self::Wave2 => &[StageId::Citations],
            Self::Citations => &[StageId::Summaries],
            Self::Summaries => &[StageId::Synthesis],
            Self::Synthesis => &[StageId::Review],
            Self::Review => &[StageId::Finalize, StageId::Synthesis],
            Self::Finalize => &[StageId::Complete],
            Self::Complete => &[],
        }
    }

    /// Returns true when the stage has no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        self.candidates().is_empty()
    }

    /// Per-stage watchdog timeout in seconds. The terminal stage never
    /// times out.
    pub fn timeout_seconds(self) -> i64 {
        match self {
            Self::Init | Self::Perspectives | Self::Pivot => 120,
            Self::Wave1 | Self::Wave2 => 900,
            Self::Citations | Self::Summaries | Self::Synthesis => 600,
            Self::Review => 300,
            Self::Finalize => 60,
            Self::Complete => i64::MAX,
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{StageId, ALL_STAGES};

    #[test]
    fn unit_stage_ids_round_trip_wire_form() {
        for stage in ALL_STAGES {
            assert_eq!(StageId::parse(stage.as_str()), Some(stage));
            let encoded = serde_json::to_string(&stage).expect("encode");
            assert_eq!(encoded, format!("\"{}\"", stage.as_str()));
        }
        assert_eq!(StageId::parse("unknown"), None);
    }

    #[test]
    fn unit_stage_graph_shapes_match_the_lifecycle() {
        assert_eq!(StageId::Init.candidates(), &[StageId::Wave1, StageId::Perspectives]);
        assert_eq!(StageId::Review.candidates(), &[StageId::Finalize, StageId::Synthesis]);
        assert!(StageId::Complete.is_terminal());
        assert!(!StageId::Finalize.is_terminal());
    }

    #[test]
    fn unit_stage_timeouts_follow_the_watchdog_table() {
        assert_eq!(StageId::Init.timeout_seconds(), 120);
        assert_eq!(StageId::Wave1.timeout_seconds(), 900);
        assert_eq!(StageId::Summaries.timeout_seconds(), 600);
        assert_eq!(StageId::Review.timeout_seconds(), 300);
        assert_eq!(StageId::Finalize.timeout_seconds(), 60);
    }
}
