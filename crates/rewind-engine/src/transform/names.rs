//! Synthetic method names

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

static GLOBAL: Lazy<Arc<NameCounter>> = Lazy::new(|| Arc::new(NameCounter::new()));

/// De-duplicates continuation names per owner and base name
///
/// Overloaded methods share a name, so each request for the same
/// `owner.base` yields the next free variant.
#[derive(Debug, Default)]
pub struct NameCounter {
    counts: Mutex<FxHashMap<String, u32>>,
}

impl NameCounter {
    /// Create an independent counter
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide counter
    pub fn global() -> Arc<NameCounter> {
        Arc::clone(&GLOBAL)
    }

    /// Next name for `base` in `owner`: `base{suffix}`, then `base{suffix}$1`, ...
    pub fn next_name(&self, owner: &str, base: &str, suffix: &str) -> String {
        let key = format!("{}.{}{}", owner, base, suffix);
        let mut counts = self.counts.lock();
        let count = counts.entry(key).or_insert(0);
        let name = if *count == 0 {
            format!("{}{}", base, suffix)
        } else {
            format!("{}{}${}", base, suffix, count)
        };
        *count += 1;
        name
    }

    /// Forget every issued name
    pub fn reset(&self) {
        self.counts.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence() {
        let names = NameCounter::new();
        assert_eq!(names.next_name("a.B", "run", "$async"), "run$async");
        assert_eq!(names.next_name("a.B", "run", "$async"), "run$async$1");
        assert_eq!(names.next_name("a.C", "run", "$async"), "run$async");
        names.reset();
        assert_eq!(names.next_name("a.B", "run", "$async"), "run$async");
    }

    #[test]
    fn test_concurrent_names_are_unique() {
        let names = Arc::new(NameCounter::new());
        let issued: Vec<String> = crossbeam::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let names = Arc::clone(&names);
                    s.spawn(move |_| {
                        (0..50)
                            .map(|_| names.next_name("x.Y", "f", "$async"))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        })
        .unwrap();
        let unique: rustc_hash::FxHashSet<_> = issued.iter().collect();
        assert_eq!(unique.len(), 400);
    }
}
