//! Reentrant object monitors

use super::{VmError, VmResult};
use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct MonitorState {
    owner: Option<ThreadId>,
    count: u32,
}

/// Reentrant lock owned by a thread
///
/// The owning thread may enter again; it must exit as many times as it
/// entered before another thread can acquire the monitor.
#[derive(Debug, Default)]
pub struct Monitor {
    state: Mutex<MonitorState>,
    released: Condvar,
}

impl Monitor {
    /// Create an unowned monitor
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire, blocking while another thread owns the monitor
    pub fn enter(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.count = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.count += 1;
                    return;
                }
                Some(_) => self.released.wait(&mut state),
            }
        }
    }

    /// Release one hold; fails unless the current thread owns the monitor
    pub fn exit(&self) -> VmResult<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return Err(VmError::IllegalMonitorState);
        }
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            self.released.notify_one();
        }
        Ok(())
    }

    /// Whether the current thread owns the monitor
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Number of holds by the owner, 0 when free
    pub fn hold_count(&self) -> u32 {
        self.state.lock().count
    }
}
