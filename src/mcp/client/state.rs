use crate::mcp::error::McpError;
use serde::Serialize;
use std::fmt;

/// Lifecycle of a single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether `self -> next` is a legal edge of the lifecycle graph.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Connecting)
            | (Connecting, Handshaking)
            | (Handshaking, Ready)
            | (Ready, Closing)
            | (Closing, Closed) => true,
            // Closing before the handshake finished is allowed.
            (Idle | Connecting | Handshaking, Closing) => true,
            (Closed, _) => false,
            (Failed, _) => false,
            (_, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus the failure that moved the session into `Failed`.
#[derive(Debug, Clone)]
pub(crate) struct StateCell {
    state: SessionState,
    failure: Option<McpError>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            failure: None,
        }
    }
}

impl StateCell {
    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn failure(&self) -> Option<&McpError> {
        self.failure.as_ref()
    }

    pub(crate) fn transition(
        &mut self,
        next: SessionState,
        operation: &str,
    ) -> Result<SessionState, McpError> {
        if !self.state.can_transition_to(next) {
            return Err(McpError::InvalidState {
                state: self.state,
                operation: operation.to_string(),
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    /// Records the first fatal failure. Later failures and closed sessions are
    /// left untouched.
    pub(crate) fn fail(&mut self, error: McpError) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = SessionState::Failed;
        self.failure = Some(error);
        true
    }

    /// Error handed to callers of operations that need a ready session.
    pub(crate) fn require_ready(&self, operation: &str) -> Result<(), McpError> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Failed => Err(self.failure.clone().unwrap_or(McpError::InvalidState {
                state: SessionState::Failed,
                operation: operation.to_string(),
            })),
            state => Err(McpError::InvalidState {
                state,
                operation: operation.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_accepted() {
        let mut cell = StateCell::default();
        for next in [
            SessionState::Connecting,
            SessionState::Handshaking,
            SessionState::Ready,
            SessionState::Closing,
            SessionState::Closed,
        ] {
            cell.transition(next, "test").expect("legal transition");
        }
        assert_eq!(cell.state(), SessionState::Closed);
    }

    #[test]
    fn closed_session_never_becomes_ready() {
        let mut cell = StateCell::default();
        cell.transition(SessionState::Closing, "close").unwrap();
        cell.transition(SessionState::Closed, "close").unwrap();

        let err = cell
            .transition(SessionState::Ready, "connect")
            .expect_err("closed is terminal");
        assert_eq!(
            err,
            McpError::InvalidState {
                state: SessionState::Closed,
                operation: "connect".to_string()
            }
        );
        assert!(!cell.fail(McpError::ConnectionLost("late".to_string())));
    }

    #[test]
    fn failure_is_reported_to_later_callers() {
        let mut cell = StateCell::default();
        cell.transition(SessionState::Connecting, "connect").unwrap();
        assert!(cell.fail(McpError::Connection("spawn failed".to_string())));
        assert!(!cell.fail(McpError::ConnectionLost("second".to_string())));

        let err = cell.require_ready("tools/list").expect_err("failed");
        assert_eq!(err, McpError::Connection("spawn failed".to_string()));
        assert!(cell.failure().is_some());
    }

    #[test]
    fn operations_before_ready_are_invalid_state() {
        let cell = StateCell::default();
        let err = cell.require_ready("ping").expect_err("idle");
        assert_eq!(err.kind().as_str(), "invalid_state");
        assert!(!SessionState::Ready.can_transition_to(SessionState::Connecting));
    }
}
