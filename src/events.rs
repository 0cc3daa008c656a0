use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub id: u64,
    pub client_key: String,
}

impl Request {
    pub fn new(id: u64, client_key: impl Into<String>) -> Self {
        Self {
            id,
            client_key: client_key.into(),
        }
    }
}

/// Result of one synthetic request. Refusals and pool exhaustion are
/// ordinary outcomes here, never errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "kebab-case")]
pub enum Outcome {
    Completed,
    Error(FailureKind),
    TimedOut,
    Refused(RefusalReason),
}

impl Outcome {
    pub fn is_refused(&self) -> bool {
        matches!(self, Outcome::Refused(_))
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed => f.write_str("completed"),
            Outcome::Error(kind) => write!(f, "error ({})", kind),
            Outcome::TimedOut => f.write_str("timed out"),
            Outcome::Refused(reason) => write!(f, "refused ({})", reason),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Backend,
    PoolExhausted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Backend => f.write_str("backend"),
            FailureKind::PoolExhausted => f.write_str("pool exhausted"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefusalReason {
    Overloaded,
    Paused,
    Forced,
    Stopped,
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefusalReason::Overloaded => f.write_str("overloaded"),
            RefusalReason::Paused => f.write_str("paused"),
            RefusalReason::Forced => f.write_str("forced"),
            RefusalReason::Stopped => f.write_str("stopped"),
        }
    }
}

/// An item due for release at a simulated instant. Ordered by time, then by
/// insertion sequence so equal deadlines release first-in first-out.
pub struct ScheduledRelease<T> {
    pub at_ms: u64,
    pub seq: u64,
    pub item: T,
}

impl<T> ScheduledRelease<T> {
    pub fn new(at_ms: u64, seq: u64, item: T) -> Self {
        Self { at_ms, seq, item }
    }
}

impl<T> PartialEq for ScheduledRelease<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at_ms == other.at_ms && self.seq == other.seq
    }
}

impl<T> Eq for ScheduledRelease<T> {}

impl<T> Ord for ScheduledRelease<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at_ms
            .cmp(&other.at_ms)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl<T> PartialOrd for ScheduledRelease<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
