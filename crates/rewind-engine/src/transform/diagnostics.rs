//! Non-fatal diagnostics

use parking_lot::Mutex;
use std::fmt;

/// Where a diagnostic originates
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    /// Owning class
    pub owner: String,
    /// Method name
    pub method: String,
    /// Source line, when known
    pub line: Option<u32>,
}

impl Location {
    /// Create a location
    pub fn new(owner: impl Into<String>, method: impl Into<String>, line: Option<u32>) -> Self {
        Self {
            owner: owner.into(),
            method: method.into(),
            line,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner, self.method)?;
        if let Some(line) = self.line {
            write!(f, ":{}", line)?;
        }
        Ok(())
    }
}

/// Receiver of warnings produced while transforming
pub trait DiagnosticSink: Send + Sync {
    /// Report a non-fatal anomaly
    fn warn(&self, location: &Location, message: &str);
}

/// Sink that logs through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn warn(&self, location: &Location, message: &str) {
        tracing::warn!(location = %location, "{}", message);
    }
}

/// A stored diagnostic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Origin
    pub location: Location,
    /// Message text
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: warning: {}", self.location, self.message)
    }
}

/// Sink that keeps every diagnostic in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Diagnostics collected so far
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    /// Number of diagnostics collected so far
    pub fn len(&self) -> usize {
        self.diagnostics.lock().len()
    }

    /// Whether nothing was reported
    pub fn is_empty(&self) -> bool {
        self.diagnostics.lock().is_empty()
    }

    /// Remove and return everything collected
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock())
    }
}

impl DiagnosticSink for CollectingSink {
    fn warn(&self, location: &Location, message: &str) {
        self.diagnostics.lock().push(Diagnostic {
            location: location.clone(),
            message: message.to_string(),
        });
    }
}
