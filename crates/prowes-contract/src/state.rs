use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// WES run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// The state of the run is unknown.
    Unknown,
    /// Accepted by the gateway, not yet handed to a backend.
    Queued,
    /// Accepted by a backend, preparing to run.
    Initializing,
    Running,
    Paused,
    Complete,
    /// The run failed inside the workflow engine.
    ExecutorError,
    /// The run failed because of the gateway or backend infrastructure.
    SystemError,
    /// Cancellation was requested and is in progress.
    Canceling,
    Canceled,
}

impl State {
    /// Canonical run state machine, kept next to the transition table.
    pub const ASCII_STATE_MACHINE: &str = r#"queued --> initializing --> running <--> paused
  |              |              |            |
  |              +--------------+------------+--> complete | executor_error | system_error
  |
  +--> system_error (dispatch failed)
  +--> canceled (canceled before dispatch)
  +--> canceling <-- (any non-terminal state)
                canceling --> canceled | complete | executor_error | system_error
unknown --> any"#;

    /// Every state, in declaration order.
    pub const ALL: [State; 10] = [
        State::Unknown,
        State::Queued,
        State::Initializing,
        State::Running,
        State::Paused,
        State::Complete,
        State::ExecutorError,
        State::SystemError,
        State::Canceling,
        State::Canceled,
    ];

    /// Whether the run has finished; finished runs never change state again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Complete | State::ExecutorError | State::SystemError | State::Canceled
        )
    }

    /// Whether a cancel request moves this run to `CANCELING`.
    pub fn is_cancelable(self) -> bool {
        matches!(
            self,
            State::Queued | State::Initializing | State::Running | State::Paused | State::Unknown
        )
    }

    /// Whether the run has been handed to a backend and can be polled.
    pub fn is_pollable(self) -> bool {
        matches!(
            self,
            State::Initializing | State::Running | State::Paused | State::Canceling | State::Unknown
        )
    }

    /// Validate a state transition from `self` to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }

        match self {
            State::Unknown => true,
            State::Queued => matches!(
                next,
                State::Initializing | State::SystemError | State::Canceling | State::Canceled
            ),
            State::Initializing => !matches!(next, State::Queued | State::Unknown),
            State::Running | State::Paused => {
                !matches!(next, State::Queued | State::Initializing | State::Unknown)
            }
            State::Canceling => next.is_terminal(),
            State::Complete | State::ExecutorError | State::SystemError | State::Canceled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Unknown => "UNKNOWN",
            State::Queued => "QUEUED",
            State::Initializing => "INITIALIZING",
            State::Running => "RUNNING",
            State::Paused => "PAUSED",
            State::Complete => "COMPLETE",
            State::ExecutorError => "EXECUTOR_ERROR",
            State::SystemError => "SYSTEM_ERROR",
            State::Canceling => "CANCELING",
            State::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown run state: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_sinks() {
        for from in State::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in State::ALL {
                assert_eq!(from.can_transition_to(to), from == to, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn happy_path_is_allowed() {
        let path = [
            State::Queued,
            State::Initializing,
            State::Running,
            State::Paused,
            State::Running,
            State::Complete,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn canceling_reachable_from_every_non_terminal_state() {
        for from in State::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(State::Canceling), "{from}");
        }
        assert!(State::Canceling.can_transition_to(State::Canceled));
        assert!(State::Canceling.can_transition_to(State::Complete));
        assert!(!State::Canceling.can_transition_to(State::Running));
    }

    #[test]
    fn backwards_moves_are_rejected() {
        assert!(!State::Initializing.can_transition_to(State::Queued));
        assert!(!State::Running.can_transition_to(State::Initializing));
        assert!(!State::Running.can_transition_to(State::Unknown));
        assert!(!State::Queued.can_transition_to(State::Running));
    }

    #[test]
    fn wire_names_roundtrip() {
        for state in State::ALL {
            let json = serde_json::to_value(state).unwrap();
            assert_eq!(json, serde_json::json!(state.as_str()));
            assert_eq!(state.as_str().parse::<State>().unwrap(), state);
        }
        assert!("DONE".parse::<State>().is_err());
    }
}
