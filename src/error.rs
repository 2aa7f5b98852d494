use thiserror::Error;

/// Partial stdout/stderr captured before an invocation failed.
///
/// Every timeout and cap failure carries whatever output was observed up to
/// the moment the terminator fired, so callers can still feed it onward.
#[derive(Debug, Clone, Default)]
pub struct PartialOutput {
    pub stdout: String,
    pub stderr: String,
}

impl PartialOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    /// stdout when non-empty, else stderr, else both joined when both present.
    pub fn combined(&self) -> String {
        if !self.stdout.is_empty() && !self.stderr.is_empty() {
            format!("{}\n{}", self.stdout, self.stderr)
        } else if !self.stdout.is_empty() {
            self.stdout.clone()
        } else {
            self.stderr.clone()
        }
    }
}

#[derive(Debug, Error)]
pub enum DroverError {
    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("failed to spawn {executable}: {message}")]
    Spawn { executable: String, message: String },

    #[error("hard timeout after {elapsed_ms}ms")]
    HardTimeout {
        elapsed_ms: u64,
        partial: PartialOutput,
    },

    #[error("idle timeout: no output for {idle_ms}ms")]
    IdleTimeout {
        idle_ms: u64,
        partial: PartialOutput,
    },

    #[error("safety timeout: no exit event observed within {elapsed_ms}ms")]
    SafetyTimeout {
        elapsed_ms: u64,
        partial: PartialOutput,
    },

    #[error("output exceeded {limit} byte limit")]
    OutputTooLarge {
        limit: usize,
        partial: PartialOutput,
    },

    #[error("invocation cancelled")]
    Cancelled { partial: PartialOutput },

    #[error("memory store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("review parse failure: {0}")]
    ReviewParse(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl DroverError {
    /// Partial output attached to invocation failures, if any.
    pub fn partial_output(&self) -> Option<&PartialOutput> {
        match self {
            Self::HardTimeout { partial, .. }
            | Self::IdleTimeout { partial, .. }
            | Self::SafetyTimeout { partial, .. }
            | Self::OutputTooLarge { partial, .. }
            | Self::Cancelled { partial } => Some(partial),
            _ => None,
        }
    }

    /// Produce a sanitized error message safe for returning to HTTP clients.
    /// Does not leak binary paths, internal URLs, or raw subprocess buffers.
    pub fn user_message(&self) -> String {
        match self {
            Self::EmptyPrompt => "prompt must not be empty".to_string(),
            Self::RepositoryNotFound(name) => format!("repository not found: {name}"),
            Self::Spawn { .. } => "failed to start the worker process".to_string(),
            Self::HardTimeout { elapsed_ms, .. } => {
                format!("worker timed out after {elapsed_ms}ms")
            }
            Self::IdleTimeout { idle_ms, .. } => {
                format!("worker produced no output for {idle_ms}ms")
            }
            Self::SafetyTimeout { .. } => "worker exit was never observed".to_string(),
            Self::OutputTooLarge { limit, .. } => {
                format!("worker output exceeded the {limit} byte limit")
            }
            Self::Cancelled { .. } => "request was cancelled".to_string(),
            Self::StoreUnavailable(_) => "conversation memory is unavailable".to_string(),
            Self::ReviewParse(_) => "failed to parse the review verdict".to_string(),
            Self::Request(_) => "outbound request failed".to_string(),
            Self::Other(_) => "an error occurred".to_string(),
        }
    }
}
