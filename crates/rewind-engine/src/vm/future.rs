//! Native futures
//!
//! A future settles once, either completed with a value or failed with an
//! exception value. Callbacks registered before settlement run on the thread
//! that settles the future; callbacks registered afterwards run immediately
//! on the registering thread.

use super::value::Value;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;

/// How a future settled
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Completed with a value
    Completed(Value),
    /// Failed with an exception value
    Failed(Value),
}

type Callback = Box<dyn FnOnce(&Outcome) + Send>;

enum State {
    Pending(Vec<Callback>),
    Settled(Outcome),
}

struct Cell {
    state: Mutex<State>,
    settled: Condvar,
}

/// Shared handle to a single-assignment result
#[derive(Clone)]
pub struct Future(Arc<Cell>);

impl Future {
    fn with_state(state: State) -> Self {
        Future(Arc::new(Cell {
            state: Mutex::new(state),
            settled: Condvar::new(),
        }))
    }

    /// A future that is not settled yet
    pub fn pending() -> Self {
        Self::with_state(State::Pending(Vec::new()))
    }

    /// An already completed future
    pub fn completed(value: Value) -> Self {
        Self::with_state(State::Settled(Outcome::Completed(value)))
    }

    /// An already failed future
    pub fn failed(error: Value) -> Self {
        Self::with_state(State::Settled(Outcome::Failed(error)))
    }

    /// Whether the future has settled
    pub fn is_done(&self) -> bool {
        matches!(*self.0.state.lock(), State::Settled(_))
    }

    /// The outcome, if settled
    pub fn outcome(&self) -> Option<Outcome> {
        match &*self.0.state.lock() {
            State::Settled(outcome) => Some(outcome.clone()),
            State::Pending(_) => None,
        }
    }

    /// Complete with `value`; false if already settled
    pub fn complete(&self, value: Value) -> bool {
        self.settle(Outcome::Completed(value))
    }

    /// Fail with `error`; false if already settled
    pub fn fail(&self, error: Value) -> bool {
        self.settle(Outcome::Failed(error))
    }

    /// Settle with `outcome` and run the registered callbacks
    pub fn settle(&self, outcome: Outcome) -> bool {
        let callbacks = {
            let mut state = self.0.state.lock();
            match &mut *state {
                State::Settled(_) => return false,
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Settled(outcome.clone());
                    self.0.settled.notify_all();
                    callbacks
                }
            }
        };
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }

    /// Run `f` once the future settles
    pub fn on_complete(&self, f: impl FnOnce(&Outcome) + Send + 'static) {
        let outcome = {
            let mut state = self.0.state.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(f));
                    return;
                }
                State::Settled(outcome) => outcome.clone(),
            }
        };
        f(&outcome);
    }

    /// Block until the future settles
    pub fn wait(&self) -> Outcome {
        let mut state = self.0.state.lock();
        loop {
            if let State::Settled(outcome) = &*state {
                return outcome.clone();
            }
            self.0.settled.wait(&mut state);
        }
    }

    /// Whether both handles refer to the same future
    pub fn ptr_eq(&self, other: &Future) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Future {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome() {
            Some(outcome) => write!(f, "Future({:?})", outcome),
            None => write!(f, "Future(pending)"),
        }
    }
}
