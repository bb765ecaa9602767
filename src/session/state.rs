use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Stopping,
    Failed,
}

impl SessionState {
    /// Transitions allowed within one session. Nothing leaves `Failed`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Idle)
                | (Connecting, Streaming)
                | (Connecting, Stopping)
                | (Connecting, Failed)
                | (Streaming, Reconnecting)
                | (Streaming, Stopping)
                | (Streaming, Failed)
                | (Reconnecting, Streaming)
                | (Reconnecting, Stopping)
                | (Reconnecting, Failed)
                | (Stopping, Idle)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Failed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Stopping => "stopping",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}
