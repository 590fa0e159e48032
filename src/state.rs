//! Per-document processing state machine.
//!
//! ```text
//! Uploaded → Extracting → Extracted → Chunking → Chunked → Embedding → Embedded
//!          → Validating → Validated | NeedsReview
//!
//! any non-terminal state ─Fail─▶ Failed
//! ```
//!
//! State changes are expressed as [`Transition`] values. Each variant names a
//! single edge of the table above, so the gateway can never be asked to apply
//! an edge that does not exist. `Fail` is only constructible through
//! [`ProcessingState::fail`], which refuses terminal states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Uploaded,
    Extracting,
    Extracted,
    Chunking,
    Chunked,
    Embedding,
    Embedded,
    Validating,
    Validated,
    NeedsReview,
    Failed,
}

/// A pipeline stage. Each stage owns one in-flight state and one committed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Extract,
    Chunk,
    Embed,
    Validate,
}

impl ProcessingState {
    pub const ALL: [ProcessingState; 11] = [
        Self::Uploaded,
        Self::Extracting,
        Self::Extracted,
        Self::Chunking,
        Self::Chunked,
        Self::Embedding,
        Self::Embedded,
        Self::Validating,
        Self::Validated,
        Self::NeedsReview,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Extracting => "extracting",
            Self::Extracted => "extracted",
            Self::Chunking => "chunking",
            Self::Chunked => "chunked",
            Self::Embedding => "embedding",
            Self::Embedded => "embedded",
            Self::Validating => "validating",
            Self::Validated => "validated",
            Self::NeedsReview => "needs_review",
            Self::Failed => "failed",
        }
    }

    /// `Validated`, `NeedsReview` and `Failed` end an attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Validated | Self::NeedsReview | Self::Failed)
    }

    /// The stage that must run next to make progress from this state.
    ///
    /// In-flight states map to their own stage: the artifact never
    /// committed, so the stage runs again.
    pub fn next_stage(&self) -> Option<Stage> {
        match self {
            Self::Uploaded | Self::Extracting => Some(Stage::Extract),
            Self::Extracted | Self::Chunking => Some(Stage::Chunk),
            Self::Chunked | Self::Embedding => Some(Stage::Embed),
            Self::Embedded | Self::Validating => Some(Stage::Validate),
            Self::Validated | Self::NeedsReview | Self::Failed => None,
        }
    }

    /// Build the failure edge out of this state, if one exists.
    pub fn fail(self) -> Option<Transition> {
        if self.is_terminal() {
            None
        } else {
            Some(Transition::Fail(FailFrom(self)))
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown processing state: {}", s))
    }
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Chunk => "chunk",
            Self::Embed => "embed",
            Self::Validate => "validate",
        }
    }

    /// The committed state a stage starts from.
    pub fn ready_state(&self) -> ProcessingState {
        match self {
            Self::Extract => ProcessingState::Uploaded,
            Self::Chunk => ProcessingState::Extracted,
            Self::Embed => ProcessingState::Chunked,
            Self::Validate => ProcessingState::Embedded,
        }
    }

    /// The in-flight state held while the stage runs.
    pub fn running_state(&self) -> ProcessingState {
        self.begin().to()
    }

    pub fn begin(&self) -> Transition {
        match self {
            Self::Extract => Transition::BeginExtraction,
            Self::Chunk => Transition::BeginChunking,
            Self::Embed => Transition::BeginEmbedding,
            Self::Validate => Transition::BeginValidation,
        }
    }
}

/// The source state of a failure edge. Private field: only
/// [`ProcessingState::fail`] can build one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailFrom(ProcessingState);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BeginExtraction,
    CompleteExtraction,
    BeginChunking,
    CompleteChunking,
    BeginEmbedding,
    CompleteEmbedding,
    BeginValidation,
    Accept,
    FlagForReview,
    Fail(FailFrom),
}

impl Transition {
    pub fn from(&self) -> ProcessingState {
        use ProcessingState::*;
        match self {
            Self::BeginExtraction => Uploaded,
            Self::CompleteExtraction => Extracting,
            Self::BeginChunking => Extracted,
            Self::CompleteChunking => Chunking,
            Self::BeginEmbedding => Chunked,
            Self::CompleteEmbedding => Embedding,
            Self::BeginValidation => Embedded,
            Self::Accept | Self::FlagForReview => Validating,
            Self::Fail(FailFrom(state)) => *state,
        }
    }

    pub fn to(&self) -> ProcessingState {
        use ProcessingState::*;
        match self {
            Self::BeginExtraction => Extracting,
            Self::CompleteExtraction => Extracted,
            Self::BeginChunking => Chunking,
            Self::CompleteChunking => Chunked,
            Self::BeginEmbedding => Embedding,
            Self::CompleteEmbedding => Embedded,
            Self::BeginValidation => Validating,
            Self::Accept => Validated,
            Self::FlagForReview => NeedsReview,
            Self::Fail(_) => Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_labels() {
        for state in ProcessingState::ALL {
            assert_eq!(state.as_str().parse::<ProcessingState>().unwrap(), state);
        }
        assert!("paused".parse::<ProcessingState>().is_err());
    }

    #[test]
    fn test_stage_edges_chain() {
        for stage in [Stage::Extract, Stage::Chunk, Stage::Embed, Stage::Validate] {
            assert_eq!(stage.begin().from(), stage.ready_state());
            assert_eq!(stage.ready_state().next_stage(), Some(stage));
            assert_eq!(stage.running_state().next_stage(), Some(stage));
        }
        assert_eq!(Transition::CompleteExtraction.to(), Stage::Chunk.ready_state());
        assert_eq!(Transition::CompleteChunking.to(), Stage::Embed.ready_state());
        assert_eq!(Transition::CompleteEmbedding.to(), Stage::Validate.ready_state());
    }

    #[test]
    fn test_fail_only_from_non_terminal() {
        assert!(ProcessingState::Validated.fail().is_none());
        assert!(ProcessingState::NeedsReview.fail().is_none());
        assert!(ProcessingState::Failed.fail().is_none());

        let t = ProcessingState::Embedding.fail().unwrap();
        assert_eq!(t.from(), ProcessingState::Embedding);
        assert_eq!(t.to(), ProcessingState::Failed);
    }

    #[test]
    fn test_terminal_states_have_no_stage() {
        for state in ProcessingState::ALL {
            assert_eq!(state.is_terminal(), state.next_stage().is_none());
        }
    }
}
