//! Echo suppression
//!
//! A client sees its own writes come back on the change feed. Before each
//! write the store remembers a token for it (the ephemeral id of an insert,
//! the document id of a delete); the first matching event consumes the token
//! and is dropped. Tokens that never come back expire.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long a token waits for its echo
pub const DEFAULT_ECHO_TTL: Duration = Duration::from_secs(120);

/// Fire-once set of expected echo tokens
#[derive(Debug)]
pub struct EchoFilter {
    entries: HashMap<String, Instant>,
    ttl: Duration,
}

impl Default for EchoFilter {
    fn default() -> Self {
        Self::new(DEFAULT_ECHO_TTL)
    }
}

impl EchoFilter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Expect an echo carrying `token`
    pub fn remember(&mut self, token: impl Into<String>) {
        self.purge();
        self.entries.insert(token.into(), Instant::now() + self.ttl);
    }

    /// Consume `token`, returning whether it was expected
    pub fn take(&mut self, token: &str) -> bool {
        self.purge();
        self.entries.remove(token).is_some()
    }

    /// Tokens still waiting
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, deadline| *deadline > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_fires_once() {
        let mut filter = EchoFilter::default();
        filter.remember("e1");

        assert!(filter.take("e1"));
        assert!(!filter.take("e1"));
        assert!(!filter.take("other"));
        assert!(filter.is_empty());
    }

    #[test]
    fn test_entries_expire() {
        let mut filter = EchoFilter::new(Duration::from_millis(20));
        filter.remember("late");
        assert_eq!(filter.len(), 1);

        std::thread::sleep(Duration::from_millis(40));

        assert!(!filter.take("late"));
        assert!(filter.is_empty());
    }
}
