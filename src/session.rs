use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Generates a fresh opaque token: a microsecond unix timestamp prefix keeps
/// tokens time-ordered, a random suffix keeps them unique under concurrent
/// callers.
pub fn fresh_token() -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    format!("{micros:016x}-{:016x}", rand::random::<u64>())
}

/// Server-side authority over the set of live measurement sessions.
///
/// A session is an opaque token handed out on create and required by every
/// subsequent chunk and probe request. All operations are safe under
/// unbounded concurrent callers; the internal mutex is held only for the
/// duration of the map operation, never across network calls.
///
/// Sessions are never removed automatically: an unclosed session stays in
/// the registry for the lifetime of the process.
///
/// # Examples
///
/// ```
/// use netgauge::session::SessionRegistry;
///
/// let registry = SessionRegistry::new();
/// let sid = registry.create();
/// assert!(registry.exists(&sid));
/// assert!(registry.delete(&sid));
/// assert!(!registry.exists(&sid));
/// ```
// TODO: sessions never expire; add expiry as an explicit extension.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Instant>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new session and returns its identifier. Never fails.
    pub fn create(&self) -> String {
        let sid = fresh_token();
        self.sessions.lock().insert(sid.clone(), Instant::now());
        sid
    }

    /// Returns whether the given session identifier is currently live.
    pub fn exists(&self, sid: &str) -> bool {
        self.sessions.lock().contains_key(sid)
    }

    /// Removes the session if present; returns whether it existed.
    pub fn delete(&self, sid: &str) -> bool {
        self.sessions.lock().remove(sid).is_some()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lifecycle() {
        let registry = SessionRegistry::new();
        assert!(!registry.exists("no-such-session"));

        let sid = registry.create();
        assert!(registry.exists(&sid));
        assert_eq!(registry.len(), 1);

        assert!(registry.delete(&sid));
        assert!(!registry.exists(&sid));
        assert!(!registry.delete(&sid));
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_creates_produce_distinct_ids() {
        let registry = Arc::new(SessionRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                (0..64).map(|_| registry.create()).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<String> = Vec::new();
        for handle in handles {
            all.extend(handle.join().expect("worker panicked"));
        }
        let count = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), count, "duplicate session ids generated");
        assert_eq!(registry.len(), count);
    }

    #[test]
    fn tokens_are_time_ordered() {
        let first = fresh_token();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = fresh_token();
        assert!(first < second);
    }
}
