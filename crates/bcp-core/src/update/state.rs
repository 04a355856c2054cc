//! Firmware updater session states.

use std::fmt;

use super::artifact::ArtifactKind;
use crate::fault::Fault;

/// Where the updater session stands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UpdateState {
    /// No session started.
    #[default]
    Idle,
    /// StartUpdate running.
    Initializing,
    /// Nonce handed out; artifacts and commit are accepted.
    AwaitingChallenge,
    /// Artifact transfer in progress.
    WritingArtifact(ArtifactKind),
    /// Waiting for the updater to finish processing an artifact.
    PollingUpdater,
    Committing,
    Done,
    Failed(Fault),
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateState::Idle => write!(f, "IDLE"),
            UpdateState::Initializing => write!(f, "INITIALIZING"),
            UpdateState::AwaitingChallenge => write!(f, "AWAITING_CHALLENGE"),
            UpdateState::WritingArtifact(kind) => write!(f, "WRITING({})", kind),
            UpdateState::PollingUpdater => write!(f, "POLLING"),
            UpdateState::Committing => write!(f, "COMMITTING"),
            UpdateState::Done => write!(f, "DONE"),
            UpdateState::Failed(fault) => write!(f, "FAILED({})", fault.code()),
        }
    }
}

impl UpdateState {
    /// SendData and CommitImage are only valid here.
    pub fn accepts_artifacts(&self) -> bool {
        matches!(self, UpdateState::AwaitingChallenge)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateState::Done | UpdateState::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_and_gating() {
        assert_eq!(UpdateState::default(), UpdateState::Idle);
        assert!(UpdateState::AwaitingChallenge.accepts_artifacts());
        assert!(!UpdateState::Idle.accepts_artifacts());
        assert!(!UpdateState::Done.accepts_artifacts());

        let failed = UpdateState::Failed(Fault::Timeout("poll".into()));
        assert!(failed.is_terminal());
        assert_eq!(failed.to_string(), "FAILED(timeout)");
        assert_eq!(
            UpdateState::WritingArtifact(ArtifactKind::Certificate).to_string(),
            "WRITING(certificate)"
        );
    }
}
