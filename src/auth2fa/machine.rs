//! 2FA state machine.
//!
//! All transitions happen while holding the coordinator's mutex; handlers
//! never hold it across an await.

/// States of the 2FA flow. `Success`, `Failed`, and `Cancelled` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Constructed, server not yet started.
    Idle,
    /// Server up, waiting for the user to act.
    Listening,
    /// A resend was asked of the cloud; answer pending.
    Requested,
    /// The cloud accepted the resend; a code is on its way.
    AwaitingCode,
    /// A submitted code is being verified. Only one at a time.
    Validating,
    Success,
    Failed,
    Cancelled,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Requested => "requested",
            Self::AwaitingCode => "awaiting_code",
            Self::Validating => "validating",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

/// Mutable flow state guarded by the coordinator mutex.
#[derive(Debug)]
pub struct Machine {
    pub state: AuthState,
    /// Displayed verbatim by the web UI.
    pub message: String,
    /// The accepted code; set only in `Success`, handed to the caller and
    /// then dropped with the coordinator.
    pub code: Option<String>,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: AuthState::Idle,
            message: String::new(),
            code: None,
        }
    }

    /// Move to `state`. Terminal states are sticky: once reached, further
    /// transitions are ignored so a late verify result cannot resurrect a
    /// timed-out flow.
    pub fn transition(&mut self, state: AuthState, message: impl Into<String>) {
        if self.state.is_terminal() {
            tracing::debug!(
                "Ignoring transition {} -> {} after terminal state",
                self.state.as_str(),
                state.as_str()
            );
            return;
        }
        tracing::info!("2FA state: {} -> {}", self.state.as_str(), state.as_str());
        self.state = state;
        self.message = message.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_idle() {
        let machine = Machine::new();
        assert_eq!(machine.state, AuthState::Idle);
        assert!(machine.code.is_none());
    }

    #[test]
    fn transition_updates_state_and_message() {
        let mut machine = Machine::new();
        machine.transition(AuthState::Listening, "waiting");
        assert_eq!(machine.state, AuthState::Listening);
        assert_eq!(machine.message, "waiting");
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut machine = Machine::new();
        machine.transition(AuthState::Failed, "timed out");
        machine.transition(AuthState::AwaitingCode, "late transition");
        assert_eq!(machine.state, AuthState::Failed);
        assert_eq!(machine.message, "timed out");
    }

    #[test]
    fn terminal_classification() {
        assert!(AuthState::Success.is_terminal());
        assert!(AuthState::Failed.is_terminal());
        assert!(AuthState::Cancelled.is_terminal());
        assert!(!AuthState::Validating.is_terminal());
        assert!(!AuthState::Listening.is_terminal());
    }
}
