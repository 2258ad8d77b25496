//! Deadline tracking for bounded, non-blocking poll loops.
//!
//! A [`Timeout`] is started when constructed and can then be queried at any
//! time to know whether the deadline has passed. The [`Timeout::never`]
//! variant never expires and is used for protocol reads that wait on a
//! physical action (e.g. an operator plugging a probe).

use std::time::{Duration, Instant};

// =============================================================================
// Public Interface
// =============================================================================

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Timeout {
    /// `None` when the timeout never expires.
    deadline: Option<Instant>,
}

impl Timeout {
    /// Start a timeout expiring `duration` from now. A deadline too far away
    /// to be represented never expires.
    pub fn new(duration: Duration) -> Self {
        Timeout {
            deadline: Instant::now().checked_add(duration),
        }
    }

    /// A timeout that never expires.
    pub fn never() -> Self {
        Timeout { deadline: None }
    }

    /// Negative values expire immediately. Infinity, NaN and values too
    /// large for a `Duration` never expire, matching [`Timeout::remaining`].
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs.is_nan() || secs >= u64::MAX as f64 {
            return Self::never();
        }
        Self::new(Duration::from_secs_f64(secs.max(0.0)))
    }

    pub fn is_never(&self) -> bool {
        self.deadline.is_none()
    }

    /// `true` once the deadline has been reached.
    pub fn expired(&self) -> bool {
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// `true` while the deadline has not been reached.
    pub fn active(&self) -> bool {
        !self.expired()
    }

    /// Seconds remaining before the deadline, negative once expired and
    /// `f64::INFINITY` for a timeout that never expires.
    pub fn remaining(&self) -> f64 {
        match self.deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline >= now {
                    (deadline - now).as_secs_f64()
                } else {
                    -(now - deadline).as_secs_f64()
                }
            }
            None => f64::INFINITY,
        }
    }

    /// Time left before the deadline, saturating at zero. `None` for a timeout
    /// that never expires.
    pub fn time_left(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn not_expired_immediately() {
    let timeout = Timeout::new(Duration::from_millis(200));
    assert!(!timeout.expired());
    assert!(timeout.active());
    assert!(timeout.remaining() > 0.0);
}

#[test]
fn expires_after_duration() {
    let timeout = Timeout::new(Duration::from_millis(20));
    std::thread::sleep(Duration::from_millis(30));
    assert!(timeout.expired());
    assert!(!timeout.active());
    assert!(timeout.remaining() < 0.0);
    assert_eq!(timeout.time_left(), Some(Duration::from_secs(0)));
}

#[test]
fn zero_duration_is_expired() {
    let timeout = Timeout::new(Duration::from_secs(0));
    assert!(timeout.expired());
}

#[test]
fn never_does_not_expire() {
    let timeout = Timeout::never();
    std::thread::sleep(Duration::from_millis(5));
    assert!(!timeout.expired());
    assert!(timeout.active());
    assert!(timeout.is_never());
    assert_eq!(timeout.time_left(), None);
    assert!(timeout.remaining().is_infinite());
}

#[test]
fn non_finite_seconds_never_expire() {
    assert!(Timeout::from_secs_f64(f64::INFINITY).is_never());
    assert!(Timeout::from_secs_f64(f64::NAN).is_never());
    assert!(Timeout::from_secs_f64(1e300).is_never());
    assert!(Timeout::from_secs_f64(f64::NEG_INFINITY).expired());
}

#[test]
fn fractional_seconds() {
    let timeout = Timeout::from_secs_f64(0.05);
    assert!(!timeout.is_never());
    assert!(timeout.active());
    std::thread::sleep(Duration::from_millis(60));
    assert!(timeout.expired());
}
