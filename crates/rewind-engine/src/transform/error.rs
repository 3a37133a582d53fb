//! Transform errors

use rewind_bytecode::{InsnId, VerifyError};

/// Failure of the frame analysis
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    /// An instruction pops more values than the stack holds
    #[error("stack underflow at {at}")]
    StackUnderflow {
        /// Popping instruction
        at: InsnId,
    },

    /// Incoming paths disagree on the stack height
    #[error("stack height mismatch at {at}: {expected} vs {found}")]
    StackMismatch {
        /// Join instruction
        at: InsnId,
        /// Height already recorded
        expected: usize,
        /// Height of the incoming path
        found: usize,
    },

    /// Incoming paths hold a different number of monitors
    #[error("monitor count mismatch at {at}: {expected} vs {found}")]
    MonitorMismatch {
        /// Join instruction
        at: InsnId,
        /// Monitors already recorded
        expected: usize,
        /// Monitors on the incoming path
        found: usize,
    },

    /// A load reads an undefined, undecided or mistyped local
    #[error("local {slot} is not readable at {at}")]
    UnreadableLocal {
        /// Loading instruction
        at: InsnId,
        /// Local slot
        slot: u16,
    },

    /// An instruction consumes a stack value of undecided type
    #[error("undecided operand consumed at {at}")]
    UndecidedOperand {
        /// Consuming instruction
        at: InsnId,
    },

    /// A load or store is beyond `max_locals`
    #[error("local {slot} out of range at {at}")]
    LocalOutOfRange {
        /// Accessing instruction
        at: InsnId,
        /// Local slot
        slot: u16,
    },

    /// A jump, handler or frame assertion names a label that is not placed
    #[error("unknown label L{0}")]
    UnknownLabel(u32),

    /// Execution can run past the last instruction
    #[error("execution falls off the end after {at}")]
    FallsOffEnd {
        /// Last instruction
        at: InsnId,
    },

    /// The fixed point was not reached within the visit budget
    #[error("frames did not converge after {visits} visits")]
    NotConverged {
        /// Instruction visits spent
        visits: usize,
    },

    /// A monitor release does not match any held monitor
    #[error("monitor released at {at} is not held")]
    UnbalancedMonitor {
        /// Releasing instruction
        at: InsnId,
    },

    /// An operand has the wrong kind for the instruction
    #[error("bad operand at {at}: expected {expected}")]
    BadOperand {
        /// Consuming instruction
        at: InsnId,
        /// What the instruction needs
        expected: &'static str,
    },
}

impl AnalysisError {
    /// Instruction the error refers to, when it has one
    pub fn at(&self) -> Option<InsnId> {
        match self {
            AnalysisError::StackUnderflow { at }
            | AnalysisError::StackMismatch { at, .. }
            | AnalysisError::MonitorMismatch { at, .. }
            | AnalysisError::UnreadableLocal { at, .. }
            | AnalysisError::UndecidedOperand { at }
            | AnalysisError::LocalOutOfRange { at, .. }
            | AnalysisError::FallsOffEnd { at }
            | AnalysisError::UnbalancedMonitor { at }
            | AnalysisError::BadOperand { at, .. } => Some(*at),
            AnalysisError::UnknownLabel(_) | AnalysisError::NotConverged { .. } => None,
        }
    }
}

/// What went wrong while transforming a method
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformErrorKind {
    /// The marker type is used as a parameter type
    #[error("parameter {index} has the awaitable marker type {ty}")]
    AwaitableParameter {
        /// Zero-based parameter index, receiver excluded
        index: usize,
        /// The offending type
        ty: String,
    },

    /// A monitor held at a suspension point is not stored in any local
    #[error("monitor held across suspension point {resume_id} is not held in a local variable")]
    MonitorNotInLocal {
        /// Suspension point holding the monitor
        resume_id: u32,
    },

    /// Frame analysis failed
    #[error("frame analysis failed: {0}")]
    Analysis(#[from] AnalysisError),

    /// A method awaits but does not return a future
    #[error("method awaits but returns {ret}, not a future")]
    NotFutureReturning {
        /// Declared return type
        ret: String,
    },

    /// An unconstructed object would have to be captured
    #[error("uninitialized {class} cannot be captured across a suspension point")]
    UninitializedCapture {
        /// Class of the allocation
        class: String,
    },

    /// A stack value of undecided type is live across a suspension point
    #[error("undecided {slot} cannot be carried across suspension point {resume_id}")]
    UndecidedCapture {
        /// Suspension point
        resume_id: u32,
        /// Frame slot holding the value
        slot: String,
    },

    /// An allocation straddling a suspension point uses an unsupported pattern
    #[error("cannot defer allocation of {class}: {reason}")]
    UnsupportedConstruction {
        /// Class of the allocation
        class: String,
        /// The pattern that was found
        reason: String,
    },

    /// A live slot at a suspension point has no captured variable
    #[error("no captured variable for {slot} at suspension point {resume_id}")]
    MissingCapture {
        /// Suspension point
        resume_id: u32,
        /// Frame slot without a variable
        slot: String,
    },

    /// The dispatch table does not match the suspension points
    #[error("dispatch table does not cover resume state {0}")]
    UnknownResumeState(u32),

    /// The emitted code failed verification
    #[error("emitted code is invalid: {0}")]
    InvalidOutput(String),
}

impl From<VerifyError> for TransformErrorKind {
    fn from(e: VerifyError) -> Self {
        TransformErrorKind::InvalidOutput(e.to_string())
    }
}

/// Fatal transform error with its location
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}.{}{}: {}", .owner, .method, line_suffix(.line), .kind)]
pub struct TransformError {
    /// Class that owns the method
    pub owner: String,
    /// Method name
    pub method: String,
    /// Source line, when known
    pub line: Option<u32>,
    /// Cause
    pub kind: TransformErrorKind,
}

fn line_suffix(line: &Option<u32>) -> String {
    match line {
        Some(line) => format!(":{}", line),
        None => String::new(),
    }
}

impl TransformError {
    /// Create an error
    pub fn new(
        owner: impl Into<String>,
        method: impl Into<String>,
        line: Option<u32>,
        kind: TransformErrorKind,
    ) -> Self {
        Self {
            owner: owner.into(),
            method: method.into(),
            line,
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_line() {
        let err = TransformError::new(
            "demo.Main",
            "run",
            Some(12),
            TransformErrorKind::UnknownResumeState(3),
        );
        assert_eq!(
            err.to_string(),
            "demo.Main.run:12: dispatch table does not cover resume state 3"
        );
    }

    #[test]
    fn test_display_without_line() {
        let err = TransformError::new(
            "demo.Main",
            "run",
            None,
            TransformErrorKind::Analysis(AnalysisError::NotConverged { visits: 10 }),
        );
        assert_eq!(
            err.to_string(),
            "demo.Main.run: frame analysis failed: frames did not converge after 10 visits"
        );
    }
}
