//! Session timeout state machine.
//!
//! `Stopped -> Running -> ExpiredSync | ExpiredAsync`, back to `Stopped` at
//! the start of the next operation. Expiry is judged against a
//! [`tokio::time::Instant`] deadline, which is monotonic.

use std::time::Duration;

use tokio::time::Instant;

/// Timer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutState {
    /// No timer armed.
    #[default]
    Stopped,
    /// Deadline armed.
    Running,
    /// Deadline passed under an asynchronous operation.
    ExpiredAsync,
    /// Deadline passed under a blocking operation.
    ExpiredSync,
}

/// How the current operation is being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Caller thread blocks until completion.
    #[default]
    Sync,
    /// Caller awaits a future.
    Async,
}

/// Deadline tracker for one session.
#[derive(Debug, Clone, Default)]
pub struct TimeoutTimer {
    state: TimeoutState,
    deadline: Option<Instant>,
    mode: ExecutionMode,
}

impl TimeoutTimer {
    /// Arm the timer; `None` means wait forever.
    pub fn start(&mut self, timeout: Option<Duration>, mode: ExecutionMode) {
        self.start_at(timeout.map(|t| Instant::now() + t), mode);
    }

    /// Arm the timer with an absolute deadline.
    pub fn start_at(&mut self, deadline: Option<Instant>, mode: ExecutionMode) {
        self.deadline = deadline;
        self.mode = mode;
        self.state = if deadline.is_some() {
            TimeoutState::Running
        } else {
            TimeoutState::Stopped
        };
    }

    /// Disarm the timer.
    pub fn stop(&mut self) {
        self.state = TimeoutState::Stopped;
        self.deadline = None;
    }

    /// Record expiry according to the execution mode.
    pub fn expire(&mut self) {
        self.state = match self.mode {
            ExecutionMode::Sync => TimeoutState::ExpiredSync,
            ExecutionMode::Async => TimeoutState::ExpiredAsync,
        };
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TimeoutState {
        self.state
    }

    /// Armed deadline, if running.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            TimeoutState::Running => self.deadline,
            _ => None,
        }
    }

    /// Time left before expiry; `None` when no deadline is armed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn has_expired(&self) -> bool {
        match self.state {
            TimeoutState::ExpiredAsync | TimeoutState::ExpiredSync => true,
            TimeoutState::Running => self.deadline.is_some_and(|d| Instant::now() >= d),
            TimeoutState::Stopped => false,
        }
    }

    /// Execution mode of the armed operation.
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_expires_on_monotonic_clock() {
        let mut timer = TimeoutTimer::default();
        timer.start(Some(Duration::from_secs(2)), ExecutionMode::Async);
        assert_eq!(timer.state(), TimeoutState::Running);
        assert!(!timer.has_expired());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(timer.has_expired());
        assert_eq!(timer.remaining(), Some(Duration::ZERO));

        timer.expire();
        assert_eq!(timer.state(), TimeoutState::ExpiredAsync);
        assert_eq!(timer.deadline(), None);
    }

    #[test]
    fn test_no_timeout_stays_stopped() {
        let mut timer = TimeoutTimer::default();
        timer.start(None, ExecutionMode::Sync);
        assert_eq!(timer.state(), TimeoutState::Stopped);
        assert!(!timer.has_expired());
        timer.expire();
        assert_eq!(timer.state(), TimeoutState::ExpiredSync);
        timer.stop();
        assert_eq!(timer.state(), TimeoutState::Stopped);
    }
}
