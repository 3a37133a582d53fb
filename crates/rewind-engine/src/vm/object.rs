//! Heap objects

use super::monitor::Monitor;
use super::value::Value;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// Shared reference to a heap object
pub type ObjectRef = Arc<Object>;

/// Instance of a class: named fields plus a monitor
pub struct Object {
    class: String,
    fields: Mutex<FxHashMap<String, Value>>,
    monitor: Monitor,
}

impl Object {
    /// Allocate an instance with no fields set
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            fields: Mutex::new(FxHashMap::default()),
            monitor: Monitor::new(),
        }
    }

    /// Class of the instance
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Field value, `None` if never set
    pub fn get_field(&self, name: &str) -> Option<Value> {
        self.fields.lock().get(name).cloned()
    }

    /// Set a field
    pub fn set_field(&self, name: impl Into<String>, value: Value) {
        self.fields.lock().insert(name.into(), value);
    }

    /// The object's monitor
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("class", &self.class)
            .field("fields", &self.fields.lock().len())
            .finish()
    }
}
