//! Bounded, case-insensitive hostname whitelist.

/// Hard caps from the data model: at most 256 entries, each at most 256
/// bytes. Mutation beyond these caps is rejected rather than silently
/// truncated so a misbehaving control-plane client gets a clear error.
pub const MAX_ENTRIES: usize = 256;
pub const MAX_ENTRY_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WhitelistError {
    #[error("whitelist already holds {MAX_ENTRIES} entries")]
    Full,
    #[error("entry exceeds {MAX_ENTRY_LEN} bytes")]
    EntryTooLong,
}

/// A bounded set of hostname substrings, matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    entries: Vec<String>,
}

impl Whitelist {
    pub fn new() -> Self {
        Whitelist::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn insert(&mut self, hostname: &str) -> Result<(), WhitelistError> {
        if hostname.len() > MAX_ENTRY_LEN {
            return Err(WhitelistError::EntryTooLong);
        }
        if self.entries.len() >= MAX_ENTRIES {
            return Err(WhitelistError::Full);
        }
        let lower = hostname.to_ascii_lowercase();
        if !self.entries.contains(&lower) {
            self.entries.push(lower);
        }
        Ok(())
    }

    pub fn remove(&mut self, hostname: &str) -> bool {
        let lower = hostname.to_ascii_lowercase();
        let before = self.entries.len();
        self.entries.retain(|e| e != &lower);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Case-insensitive substring match: `hostname` is whitelisted if any
    /// entry occurs as a substring of it (entries are substrings of the
    /// observed hostname; the reverse direction is not needed).
    pub fn matches(&self, hostname: &str) -> bool {
        let lower = hostname.to_ascii_lowercase();
        self.entries.iter().any(|e| lower.contains(e.as_str()))
    }
}
