//! Error kinds shared across the engine (spec §7).
//!
//! The base crate returns plain result-variant enums (`OrderResult`,
//! `CancelReason`) rather than a typed exception hierarchy; `EngineError`
//! follows the same shape instead of reaching for `thiserror`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigInvalid,
    Connectivity,
    RateLimited,
    Throttled,
    Signing,
    Rejected,
    NotFilled,
    PreconditionFailed,
    Duplicate,
    Staleness,
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Throttled => "throttled",
            ErrorKind::Signing => "signing",
            ErrorKind::Rejected => "rejected",
            ErrorKind::NotFilled => "not_filled",
            ErrorKind::PreconditionFailed => "precondition_failed",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::Staleness => "staleness",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Pragmatic detector per spec §4.6 step 7 / §9: adapter error text
    /// containing "rate" or "429" is treated as throttling. Kept as the
    /// spec explicitly calls this out as a deliberate, temporary detector
    /// rather than a clean error classification.
    pub fn looks_throttled(text: &str) -> bool {
        let lower = text.to_ascii_lowercase();
        lower.contains("rate") || lower.contains("429")
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for EngineError {}
