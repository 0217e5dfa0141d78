//! Shared bypass configuration, mutated by the control plane and read by the
//! bypass engine on each packet (snapshot semantics: a clone is cheap and the
//! engine never needs to observe a settings change mid-packet).

use serde::{Deserialize, Serialize};

/// The fragmentation strategy applied to an eligible segment's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BypassMethod {
    None,
    Split,
    SplitReverse,
    Disorder,
    DisorderReverse,
}

impl Default for BypassMethod {
    fn default() -> Self {
        BypassMethod::Split
    }
}

pub const DEFAULT_FIRST_SPLIT_OFFSET: usize = 2;
pub const DEFAULT_INTER_FRAGMENT_DELAY_MS: u64 = 50;
pub const DEFAULT_FRAGMENT_COUNT: usize = 4;
pub const MIN_FRAGMENT_COUNT: usize = 2;
pub const MAX_FRAGMENT_COUNT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassSettings {
    pub method: BypassMethod,
    pub first_split_offset: usize,
    pub inter_fragment_delay_ms: u64,
    pub fragment_count: usize,
    pub desync_https: bool,
    pub desync_http: bool,
    pub mix_host_case: bool,
    pub block_quic: bool,
}

impl Default for BypassSettings {
    fn default() -> Self {
        BypassSettings {
            method: BypassMethod::default(),
            first_split_offset: DEFAULT_FIRST_SPLIT_OFFSET,
            inter_fragment_delay_ms: DEFAULT_INTER_FRAGMENT_DELAY_MS,
            fragment_count: DEFAULT_FRAGMENT_COUNT,
            desync_https: true,
            desync_http: false,
            mix_host_case: false,
            block_quic: false,
        }
    }
}

impl BypassSettings {
    /// Clamps `fragment_count` into `[MIN_FRAGMENT_COUNT, MAX_FRAGMENT_COUNT]`
    /// in place; called whenever settings are accepted from an external
    /// source (control plane, CLI) so the stored value is always valid.
    pub fn normalize(&mut self) {
        self.fragment_count = self
            .fragment_count
            .clamp(MIN_FRAGMENT_COUNT, MAX_FRAGMENT_COUNT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = BypassSettings::default();
        assert_eq!(s.method, BypassMethod::Split);
        assert_eq!(s.first_split_offset, 2);
        assert_eq!(s.inter_fragment_delay_ms, 50);
    }

    #[test]
    fn normalize_clamps_fragment_count() {
        let mut s = BypassSettings {
            fragment_count: 999,
            ..BypassSettings::default()
        };
        s.normalize();
        assert_eq!(s.fragment_count, MAX_FRAGMENT_COUNT);

        let mut s = BypassSettings {
            fragment_count: 0,
            ..BypassSettings::default()
        };
        s.normalize();
        assert_eq!(s.fragment_count, MIN_FRAGMENT_COUNT);
    }

    #[test]
    fn settings_round_trip_through_json() {
        // Exercised at the serde boundary the control plane uses.
        let s = BypassSettings {
            method: BypassMethod::DisorderReverse,
            fragment_count: 6,
            mix_host_case: true,
            ..BypassSettings::default()
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: BypassSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }
}
