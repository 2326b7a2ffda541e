//! Derived session state and the user-visible error side channel

use crate::error::{AudioError, ErrorSource};

/// Coarse session state shown to the user
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Listening,
    Speaking,
}

impl SessionState {
    /// Speaking whenever the peer is audible, otherwise Listening while the
    /// microphone is open
    pub fn derive(capturing: bool, speaking: bool) -> Self {
        if speaking {
            SessionState::Speaking
        } else if capturing {
            SessionState::Listening
        } else {
            SessionState::Idle
        }
    }
}

/// What the UI renders after each reaction
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub status: String,
    pub error: Option<String>,
}

/// Holds the status line and the last error
///
/// State itself is never stored here; see [`SessionState::derive`].
#[derive(Debug, Default)]
pub struct SessionController {
    status: String,
    error: Option<(ErrorSource, String)>,
}

impl SessionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_ref().map(|(_, msg)| msg.as_str())
    }

    /// Record an error without touching state
    pub fn report(&mut self, error: &AudioError) {
        self.error = Some((error.source_kind(), error.to_string()));
    }

    /// Clear the error if it came from `source`
    ///
    /// Called by the operation that supersedes a failure of the same kind,
    /// so an unrelated success never hides a stale error.
    pub fn supersede(&mut self, source: ErrorSource) {
        if matches!(self.error, Some((s, _)) if s == source) {
            self.error = None;
        }
    }

    /// Clear whatever error is shown
    pub fn dismiss(&mut self) {
        self.error = None;
    }

    pub fn snapshot(&self, state: SessionState) -> SessionSnapshot {
        SessionSnapshot {
            state,
            status: self.status.clone(),
            error: self.error().map(str::to_string),
        }
    }
}
