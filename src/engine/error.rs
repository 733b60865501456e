//! Engine Errors
//!
//! Fatal engine errors and the per-tick error type Tickables return.

use std::fmt;

/// Unrecoverable engine condition. Stops the Clock.
#[derive(Debug)]
pub enum EngineError {
    /// The time source could not produce a timestamp.
    TimeSource(String),
    /// A Tickable reported an unrecoverable error.
    Component {
        component: String,
        timestamp: i64,
        source: anyhow::Error,
    },
    /// `start`/`run` called while the Clock is already running.
    AlreadyRunning,
    /// The Clock was stopped and cannot be restarted.
    Stopped,
    /// Invalid construction parameters (tick size, backtest window).
    InvalidConfig(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimeSource(msg) => write!(f, "time source failure: {}", msg),
            Self::Component {
                component,
                timestamp,
                source,
            } => write!(
                f,
                "fatal error in component '{}' at {}: {:#}",
                component, timestamp, source
            ),
            Self::AlreadyRunning => write!(f, "clock is already running"),
            Self::Stopped => write!(f, "clock has been stopped"),
            Self::InvalidConfig(msg) => write!(f, "invalid clock configuration: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Component { source, .. } => Some(&**source),
            _ => None,
        }
    }
}

/// Error returned from a Tickable hook.
///
/// `Recoverable` skips the component for the rest of the cycle; `Fatal` stops
/// the Clock. `?` on an `anyhow::Error` yields `Recoverable`.
#[derive(Debug)]
pub enum TickError {
    Recoverable(anyhow::Error),
    Fatal(anyhow::Error),
}

impl TickError {
    pub fn recoverable(msg: impl fmt::Display) -> Self {
        Self::Recoverable(anyhow::anyhow!("{}", msg))
    }

    pub fn fatal(msg: impl fmt::Display) -> Self {
        Self::Fatal(anyhow::anyhow!("{}", msg))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl fmt::Display for TickError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recoverable(e) => write!(f, "recoverable: {:#}", e),
            Self::Fatal(e) => write!(f, "fatal: {:#}", e),
        }
    }
}

impl std::error::Error for TickError {}

impl From<anyhow::Error> for TickError {
    fn from(e: anyhow::Error) -> Self {
        Self::Recoverable(e)
    }
}
