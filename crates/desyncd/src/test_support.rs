//! In-memory test doubles shared by this crate's unit and integration
//! tests. Gated behind the `test-util` feature (mirrors tokio's
//! `test-util`), so the integration tests under `tests/` — which link
//! against this crate as an ordinary dependency, not under `cfg(test)` —
//! can reach them too.

use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::firewall::FirewallManager;

/// Records every `(queue, mark, ports)` call instead of shelling out, so
/// control-plane and bypass-fallback tests don't need real firewall
/// privileges.
#[derive(Debug, Default, Clone)]
pub struct RecordingFirewall {
    pub installs: Arc<Mutex<Vec<(u16, u32, Vec<u16>)>>>,
    pub removes: Arc<Mutex<Vec<(u16, u32, Vec<u16>)>>>,
}

impl FirewallManager for RecordingFirewall {
    fn install(&mut self, queue: u16, mark: u32, ports: &[u16]) -> Result<()> {
        self.installs
            .lock()
            .unwrap()
            .push((queue, mark, ports.to_vec()));
        Ok(())
    }

    fn remove(&mut self, queue: u16, mark: u32, ports: &[u16]) -> Result<()> {
        self.removes
            .lock()
            .unwrap()
            .push((queue, mark, ports.to_vec()));
        Ok(())
    }
}
