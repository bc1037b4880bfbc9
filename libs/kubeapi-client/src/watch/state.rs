use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a watch subscription.
///
/// `Idle → Connecting → Streaming → {Completed | Failed | Cancelled}`.
/// The last three are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl WatchState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

impl From<u8> for WatchState {
    fn from(value: u8) -> Self {
        match value {
            1 => WatchState::Connecting,
            2 => WatchState::Streaming,
            3 => WatchState::Completed,
            4 => WatchState::Failed,
            5 => WatchState::Cancelled,
            _ => WatchState::Idle,
        }
    }
}

impl From<WatchState> for u8 {
    fn from(value: WatchState) -> Self {
        match value {
            WatchState::Idle => 0,
            WatchState::Connecting => 1,
            WatchState::Streaming => 2,
            WatchState::Completed => 3,
            WatchState::Failed => 4,
            WatchState::Cancelled => 5,
        }
    }
}

/// Shared state cell, written by the producer task and read by the stream.
///
/// Once a terminal state is stored it never changes again.
#[derive(Clone, Debug)]
pub(super) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub(super) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(WatchState::Idle.into())))
    }

    pub(super) fn get(&self) -> WatchState {
        self.0.load(Ordering::Acquire).into()
    }

    /// Move to `next` unless already terminal. Returns the state in effect
    /// afterwards.
    pub(super) fn advance(&self, next: WatchState) -> WatchState {
        match self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            if WatchState::from(current).is_terminal() {
                None
            } else {
                Some(next.into())
            }
        }) {
            Ok(_) => next,
            Err(current) => current.into(),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u8() {
        for state in [
            WatchState::Idle,
            WatchState::Connecting,
            WatchState::Streaming,
            WatchState::Completed,
            WatchState::Failed,
            WatchState::Cancelled,
        ] {
            assert_eq!(WatchState::from(u8::from(state)), state);
        }
        assert_eq!(WatchState::from(200), WatchState::Idle);
    }

    #[test]
    fn terminal_state_is_sticky() {
        let cell = StateCell::new();
        assert_eq!(cell.advance(WatchState::Connecting), WatchState::Connecting);
        assert_eq!(cell.advance(WatchState::Failed), WatchState::Failed);
        assert_eq!(cell.advance(WatchState::Cancelled), WatchState::Failed);
        assert_eq!(cell.advance(WatchState::Streaming), WatchState::Failed);
        assert_eq!(cell.get(), WatchState::Failed);
    }
}
