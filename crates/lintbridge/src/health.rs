//! Lifecycle state of the supervised worker.

use serde::{Deserialize, Serialize};

/// Where the supervisor's current worker is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// `start()` has not run yet
    #[default]
    Unknown,
    /// Running the dependency install step
    Installing,
    /// Worker spawned, waiting for the handshake
    Booting,
    /// Handshake done, accepting requests
    Ready,
    /// Tearing down the old worker and booting a new one
    Restarting,
    /// Worker terminated; the next request restarts it
    Exited,
    /// Install or boot failed
    Failed,
    /// Shut down on request
    Stopped,
}

impl WorkerState {
    pub fn is_ready(&self) -> bool {
        *self == WorkerState::Ready
    }

    /// True while install, boot or restart is running.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            WorkerState::Installing | WorkerState::Booting | WorkerState::Restarting
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_default_is_unknown() {
        assert_eq!(WorkerState::default(), WorkerState::Unknown);
    }

    #[test]
    fn state_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            [
                WorkerState::Unknown,
                WorkerState::Installing,
                WorkerState::Booting,
                WorkerState::Ready,
                WorkerState::Restarting,
                WorkerState::Exited,
                WorkerState::Failed,
                WorkerState::Stopped,
            ],
            @r#"
        [
          "UNKNOWN",
          "INSTALLING",
          "BOOTING",
          "READY",
          "RESTARTING",
          "EXITED",
          "FAILED",
          "STOPPED"
        ]
        "#
        );
    }

    #[test]
    fn state_deserializes_screaming_snake_case() {
        assert_eq!(
            serde_json::from_str::<WorkerState>("\"RESTARTING\"").unwrap(),
            WorkerState::Restarting
        );
    }

    #[test]
    fn transitioning_states() {
        assert!(WorkerState::Booting.is_transitioning());
        assert!(WorkerState::Restarting.is_transitioning());
        assert!(!WorkerState::Ready.is_transitioning());
        assert!(!WorkerState::Exited.is_transitioning());
        assert!(WorkerState::Ready.is_ready());
    }
}
