//! Connectivity fallback: bounded retries that step down the traversal
//! profile, plus the one-shot recovery probe armed by a disconnect.

use std::{fmt, time::Duration};

/// Network traversal profile, ordered from most to least permissive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectivityProfile {
    Full,
    Reduced,
    Minimal,
}

impl ConnectivityProfile {
    /// Profile used after `failures` consecutive connectivity failures.
    pub fn for_failures(failures: u32) -> Self {
        match failures {
            0 | 1 => ConnectivityProfile::Full,
            2 => ConnectivityProfile::Reduced,
            _ => ConnectivityProfile::Minimal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityProfile::Full => "full",
            ConnectivityProfile::Reduced => "reduced",
            ConnectivityProfile::Minimal => "minimal",
        }
    }
}

impl fmt::Display for ConnectivityProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    count: u32,
    max_count: u32,
    is_retrying: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry {
        count: u32,
        profile: ConnectivityProfile,
    },
    Exhausted {
        attempts: u32,
    },
}

impl RetryState {
    pub fn new(max_count: u32) -> Self {
        Self {
            count: 0,
            max_count: max_count.max(1),
            is_retrying: false,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    pub fn is_retrying(&self) -> bool {
        self.is_retrying
    }

    pub fn profile(&self) -> ConnectivityProfile {
        ConnectivityProfile::for_failures(self.count)
    }

    pub fn record_failure(&mut self) -> FailureOutcome {
        self.count = self.count.saturating_add(1);
        if self.count >= self.max_count {
            self.is_retrying = false;
            FailureOutcome::Exhausted {
                attempts: self.count,
            }
        } else {
            self.is_retrying = true;
            FailureOutcome::Retry {
                count: self.count,
                profile: self.profile(),
            }
        }
    }

    /// Returns the count that was cleared.
    pub fn record_success(&mut self) -> u32 {
        let previous = self.count;
        self.count = 0;
        self.is_retrying = false;
        previous
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectAction {
    ArmProbe { delay: Duration },
    /// A probe is already pending.
    Wait,
    /// The in-place recovery already ran once; treat as a failure.
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry {
        delay: Duration,
        count: u32,
        profile: ConnectivityProfile,
    },
    Exhausted {
        attempts: u32,
    },
    /// The answering side never retries on its own; it waits for the
    /// initiator's restart offer or hangup.
    AwaitPeer,
}

#[derive(Debug, Clone)]
pub struct FallbackController {
    retry: RetryState,
    retry_delay: Duration,
    probe_delay: Duration,
    probe_armed: bool,
    recovery_attempted: bool,
}

impl FallbackController {
    pub fn new(max_retries: u32, retry_delay: Duration, probe_delay: Duration) -> Self {
        Self {
            retry: RetryState::new(max_retries),
            retry_delay,
            probe_delay,
            probe_armed: false,
            recovery_attempted: false,
        }
    }

    pub fn retry(&self) -> &RetryState {
        &self.retry
    }

    pub fn profile(&self) -> ConnectivityProfile {
        self.retry.profile()
    }

    pub fn recovery_attempted(&self) -> bool {
        self.recovery_attempted
    }

    /// Transport reached `connected`/`completed`.
    pub fn on_connected(&mut self) -> u32 {
        self.probe_armed = false;
        self.recovery_attempted = false;
        self.retry.record_success()
    }

    pub fn on_disconnected(&mut self) -> DisconnectAction {
        if self.recovery_attempted {
            return DisconnectAction::Escalate;
        }
        if self.probe_armed {
            return DisconnectAction::Wait;
        }
        self.probe_armed = true;
        DisconnectAction::ArmProbe {
            delay: self.probe_delay,
        }
    }

    /// The probe timer fired. Returns true when an in-place recovery should
    /// be attempted.
    pub fn on_probe(&mut self, still_disconnected: bool) -> bool {
        if !self.probe_armed {
            return false;
        }
        self.probe_armed = false;
        if still_disconnected {
            self.recovery_attempted = true;
        }
        still_disconnected
    }

    pub fn on_failure(&mut self, initiator: bool) -> FailureAction {
        self.probe_armed = false;
        self.recovery_attempted = false;
        if !initiator {
            return FailureAction::AwaitPeer;
        }
        match self.retry.record_failure() {
            FailureOutcome::Retry { count, profile } => FailureAction::Retry {
                delay: self.retry_delay,
                count,
                profile,
            },
            FailureOutcome::Exhausted { attempts } => FailureAction::Exhausted { attempts },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> FallbackController {
        FallbackController::new(5, Duration::from_secs(2), Duration::from_secs(3))
    }

    #[test_timeout::timeout]
    fn profile_steps_down_with_failures() {
        assert_eq!(ConnectivityProfile::for_failures(0), ConnectivityProfile::Full);
        assert_eq!(ConnectivityProfile::for_failures(1), ConnectivityProfile::Full);
        assert_eq!(
            ConnectivityProfile::for_failures(2),
            ConnectivityProfile::Reduced
        );
        assert_eq!(
            ConnectivityProfile::for_failures(3),
            ConnectivityProfile::Minimal
        );
        assert_eq!(
            ConnectivityProfile::for_failures(40),
            ConnectivityProfile::Minimal
        );
    }

    #[test_timeout::timeout]
    fn success_resets_any_prior_count() {
        for prior in 0..=5 {
            let mut state = RetryState::new(5);
            for _ in 0..prior {
                state.record_failure();
            }
            assert_eq!(state.count(), prior);
            assert_eq!(state.record_success(), prior);
            assert_eq!(state.count(), 0);
            assert!(!state.is_retrying());
        }
    }

    #[test_timeout::timeout]
    fn fifth_failure_exhausts() {
        let mut fallback = controller();
        for expected in 1..5 {
            match fallback.on_failure(true) {
                FailureAction::Retry { count, delay, .. } => {
                    assert_eq!(count, expected);
                    assert_eq!(delay, Duration::from_secs(2));
                }
                other => panic!("failure {expected} should retry, got {other:?}"),
            }
        }
        assert_eq!(
            fallback.on_failure(true),
            FailureAction::Exhausted { attempts: 5 }
        );
    }

    #[test_timeout::timeout]
    fn answering_side_never_counts_failures() {
        let mut fallback = controller();
        for _ in 0..10 {
            assert_eq!(fallback.on_failure(false), FailureAction::AwaitPeer);
        }
        assert_eq!(fallback.retry().count(), 0);
    }

    #[test_timeout::timeout]
    fn disconnect_probes_once_then_escalates() {
        let mut fallback = controller();
        assert_eq!(
            fallback.on_disconnected(),
            DisconnectAction::ArmProbe {
                delay: Duration::from_secs(3)
            }
        );
        assert_eq!(fallback.on_disconnected(), DisconnectAction::Wait);
        assert!(fallback.on_probe(true));
        assert!(fallback.recovery_attempted());
        assert_eq!(fallback.on_disconnected(), DisconnectAction::Escalate);

        fallback.on_connected();
        assert!(!fallback.recovery_attempted());
        assert!(matches!(
            fallback.on_disconnected(),
            DisconnectAction::ArmProbe { .. }
        ));
    }

    #[test_timeout::timeout]
    fn probe_stands_down_when_link_recovered() {
        let mut fallback = controller();
        fallback.on_disconnected();
        assert!(!fallback.on_probe(false));
        assert!(!fallback.recovery_attempted());
        assert!(!fallback.on_probe(true));
    }
}
