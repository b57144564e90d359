//! The worker state machine.
//!
//! A tagged state value with an explicit transition table; forbidden
//! transitions are reported to the caller, which logs and drops them.
//! `Stopped` is terminal.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Subscribing,
    PublishingVersions,
    Draining,
    Stopped,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Connecting => "connecting",
            State::Subscribing => "subscribing",
            State::PublishingVersions => "publishing-versions",
            State::Draining => "draining",
            State::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEvent {
    Connected,
    Subscribed,
    VersionsPublished,
    Disconnected,
    Stop,
}

impl fmt::Display for FsmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsmEvent::Connected => "connected",
            FsmEvent::Subscribed => "subscribed",
            FsmEvent::VersionsPublished => "versions-published",
            FsmEvent::Disconnected => "disconnected",
            FsmEvent::Stop => "stop",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct Fsm {
    state: State,
}

impl Default for Fsm {
    fn default() -> Self {
        Fsm::new()
    }
}

impl Fsm {
    pub fn new() -> Self {
        Fsm {
            state: State::Connecting,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Applies an event. Returns the new state, or `None` when the
    /// transition is forbidden (the state is left untouched).
    pub fn apply(&mut self, event: FsmEvent) -> Option<State> {
        use FsmEvent::*;
        use State::*;

        let next = match (self.state, event) {
            (Connecting, Connected) => Subscribing,
            (Subscribing, Subscribed) => PublishingVersions,
            (PublishingVersions, VersionsPublished) => Draining,
            (Stopped, _) => return None,
            (_, Disconnected) => Connecting,
            (_, Stop) => Stopped,
            _ => return None,
        };
        self.state = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut fsm = Fsm::new();
        assert_eq!(fsm.state(), State::Connecting);
        assert_eq!(fsm.apply(FsmEvent::Connected), Some(State::Subscribing));
        assert_eq!(fsm.apply(FsmEvent::Subscribed), Some(State::PublishingVersions));
        assert_eq!(
            fsm.apply(FsmEvent::VersionsPublished),
            Some(State::Draining)
        );
    }

    #[test]
    fn test_disconnect_from_any_live_state() {
        for event in [
            FsmEvent::Connected,
            FsmEvent::Subscribed,
            FsmEvent::VersionsPublished,
        ] {
            let mut fsm = Fsm::new();
            let _ = fsm.apply(FsmEvent::Connected);
            let _ = fsm.apply(event);
            assert_eq!(fsm.apply(FsmEvent::Disconnected), Some(State::Connecting));
        }
    }

    #[test]
    fn test_forbidden_transitions_keep_state() {
        let mut fsm = Fsm::new();
        assert_eq!(fsm.apply(FsmEvent::Subscribed), None);
        assert_eq!(fsm.state(), State::Connecting);
        assert_eq!(fsm.apply(FsmEvent::VersionsPublished), None);
        assert_eq!(fsm.state(), State::Connecting);
    }

    #[test]
    fn test_stopped_is_terminal() {
        let mut fsm = Fsm::new();
        assert_eq!(fsm.apply(FsmEvent::Stop), Some(State::Stopped));
        assert_eq!(fsm.apply(FsmEvent::Disconnected), None);
        assert_eq!(fsm.apply(FsmEvent::Connected), None);
        assert_eq!(fsm.state(), State::Stopped);
    }
}
