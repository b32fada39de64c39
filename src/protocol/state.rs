use serde::{Deserialize, Serialize};

/// Lifecycle of one gateway connection, mirrored by the terminal client.
///
/// ```text
/// INIT -> CONNECTING -> AUTHENTICATING -> READY -> CLOSED
///              \              \            \
///               +-> ERROR      +-> ERROR    +-> ERROR
/// ```
///
/// `Error` and `Closed` are terminal; a reconnect builds a new connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Init,
    Connecting,
    Authenticating,
    Ready,
    Error,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Closed)
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Init, Connecting)
                // precondition failures never leave INIT
                | (Init, Error)
                | (Connecting, Authenticating)
                | (Connecting, Error)
                | (Connecting, Closed)
                | (Authenticating, Ready)
                | (Authenticating, Error)
                | (Authenticating, Closed)
                | (Ready, Closed)
                | (Ready, Error)
        )
    }

    pub fn advance(&mut self, next: Self) -> Result<(), InvalidTransition> {
        if self.can_advance_to(next) {
            *self = next;
            Ok(())
        } else {
            Err(InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = ConnectionState::default();
        state.advance(ConnectionState::Connecting).unwrap();
        state.advance(ConnectionState::Authenticating).unwrap();
        state.advance(ConnectionState::Ready).unwrap();
        state.advance(ConnectionState::Closed).unwrap();
        assert!(state.is_terminal());
    }

    #[test]
    fn test_terminal_states_stay_terminal() {
        let mut state = ConnectionState::Error;
        let err = state.advance(ConnectionState::Connecting).unwrap_err();
        assert_eq!(err.from, ConnectionState::Error);
        assert_eq!(state, ConnectionState::Error);

        let mut closed = ConnectionState::Closed;
        assert!(closed.advance(ConnectionState::Ready).is_err());
    }

    #[test]
    fn test_ready_requires_authentication() {
        let mut state = ConnectionState::Connecting;
        assert!(state.advance(ConnectionState::Ready).is_err());
        assert_eq!(state, ConnectionState::Connecting);
    }
}
