//! Analysis session metadata and its status lifecycle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RagError;

/// Lifecycle state of an analysis session.
///
/// `Processing` is the only non-terminal state; `Ready` and `Failed` never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Ingestion queued or running.
    Processing,
    /// Chunks embedded; analysis requests allowed.
    Ready,
    /// Ingestion failed; `error_message` explains why.
    Failed,
}

impl SessionStatus {
    /// Wire/database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "PROCESSING",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
        }
    }

    /// True for `Ready` and `Failed`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Processing)
    }

    /// Checks that a status write respects the lifecycle.
    pub fn check_transition(self, to: SessionStatus) -> Result<(), RagError> {
        if self.is_terminal() {
            return Err(RagError::InvalidTransition { from: self, to });
        }
        Ok(())
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = RagError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PROCESSING" => Ok(Self::Processing),
            "READY" => Ok(Self::Ready),
            "FAILED" => Ok(Self::Failed),
            other => Err(RagError::Store(format!("unknown session status '{other}'"))),
        }
    }
}

/// Persisted metadata for one analysis session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSession {
    /// Opaque session token.
    pub session_id: String,
    /// Tender whose document is analysed.
    pub tender_id: i64,
    /// User that requested the analysis.
    pub user_id: i64,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Populated only when `status` is `Failed`.
    pub error_message: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// Row returned by session listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    /// Session token.
    pub session_id: String,
    /// Owning tender.
    pub tender_id: i64,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Chunks stored for the session.
    pub chunk_count: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Generates a fresh opaque session token.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_reject_transitions() {
        assert!(SessionStatus::Processing
            .check_transition(SessionStatus::Ready)
            .is_ok());
        assert!(SessionStatus::Processing
            .check_transition(SessionStatus::Failed)
            .is_ok());
        for terminal in [SessionStatus::Ready, SessionStatus::Failed] {
            let err = terminal
                .check_transition(SessionStatus::Processing)
                .unwrap_err();
            assert!(matches!(err, RagError::InvalidTransition { .. }));
        }
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            SessionStatus::Processing,
            SessionStatus::Ready,
            SessionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<SessionStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&SessionStatus::Ready).unwrap(),
            "\"READY\""
        );
    }
}
