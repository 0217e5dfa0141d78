//! Abstract firewall capability plus the production backend that shells
//! out to `iptables`.

use std::io;
use std::process::{Command, Output};

use tracing::{info, warn};

use crate::error::{DesyncError, Result};

/// Redirects outbound TCP on `ports` to NFQUEUE `queue`, exempting packets
/// already carrying `mark`; `remove` tears the same rules back down.
/// Implementations must make `remove` idempotent.
pub trait FirewallManager: Send {
    fn install(&mut self, queue: u16, mark: u32, ports: &[u16]) -> Result<()>;
    fn remove(&mut self, queue: u16, mark: u32, ports: &[u16]) -> Result<()>;
}

/// How `IptablesFirewall` actually executes a rule-manipulation command.
/// Production code spawns the real `iptables` binary; tests substitute a
/// closure so the `--queue-bypass` fallback can be exercised without root
/// or a real netfilter stack.
pub type CommandRunner = Box<dyn Fn(&[&str]) -> io::Result<Output> + Send>;

/// Shells out to `iptables`. Tries the `NFQUEUE --queue-bypass` form first
/// so a crashed daemon doesn't leave connections stuck in a full queue with
/// no consumer; if the installed `iptables` rejects that flag, retries once
/// without it and logs a warning that crash-bypass protection is
/// unavailable.
pub struct IptablesFirewall {
    installed: bool,
    runner: CommandRunner,
}

impl std::fmt::Debug for IptablesFirewall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IptablesFirewall")
            .field("installed", &self.installed)
            .finish()
    }
}

impl Default for IptablesFirewall {
    fn default() -> Self {
        IptablesFirewall {
            installed: false,
            runner: Box::new(|args| Command::new("iptables").args(args).output()),
        }
    }
}

impl IptablesFirewall {
    pub fn new() -> Self {
        IptablesFirewall::default()
    }

    /// Builds an instance that executes rule commands through `runner`
    /// instead of spawning a real `iptables` process.
    pub fn with_runner(runner: CommandRunner) -> Self {
        IptablesFirewall {
            installed: false,
            runner,
        }
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        (self.runner)(args).map_err(|e| DesyncError::Firewall(format!("failed to spawn iptables: {e}")))
    }

    fn mark_exempt_rule(&self, mark: u32, action: &str) -> Vec<String> {
        vec![
            action.to_string(),
            "OUTPUT".to_string(),
            "-m".to_string(),
            "mark".to_string(),
            "--mark".to_string(),
            format!("0x{mark:x}"),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]
    }

    fn nfqueue_rule(&self, port: u16, queue: u16, action: &str, queue_bypass: bool) -> Vec<String> {
        let mut args = vec![
            action.to_string(),
            "OUTPUT".to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "--dport".to_string(),
            port.to_string(),
            "-j".to_string(),
            "NFQUEUE".to_string(),
            "--queue-num".to_string(),
            queue.to_string(),
        ];
        if queue_bypass {
            args.push("--queue-bypass".to_string());
        }
        args
    }
}

impl FirewallManager for IptablesFirewall {
    fn install(&mut self, queue: u16, mark: u32, ports: &[u16]) -> Result<()> {
        // Clear any stale rules from a previous, uncleanly-terminated run
        // before installing fresh ones.
        let _ = self.remove(queue, mark, ports);

        let exempt: Vec<String> = self.mark_exempt_rule(mark, "-I");
        let exempt_refs: Vec<&str> = exempt.iter().map(String::as_str).collect();
        let out = self.run(&exempt_refs)?;
        if !out.status.success() {
            return Err(DesyncError::Firewall(format!(
                "failed to install mark-exempt rule: {}",
                String::from_utf8_lossy(&out.stderr)
            )));
        }

        for &port in ports {
            let args = self.nfqueue_rule(port, queue, "-A", true);
            let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            let out = self.run(&args_refs)?;
            if out.status.success() {
                continue;
            }

            warn!(port, "iptables rejected --queue-bypass, retrying without it");
            let fallback = self.nfqueue_rule(port, queue, "-A", false);
            let fallback_refs: Vec<&str> = fallback.iter().map(String::as_str).collect();
            let out = self.run(&fallback_refs)?;
            if !out.status.success() {
                return Err(DesyncError::Firewall(format!(
                    "failed to install NFQUEUE rule for port {port}: {}",
                    String::from_utf8_lossy(&out.stderr)
                )));
            }
        }

        self.installed = true;
        info!(queue, ?ports, "firewall rules installed");
        Ok(())
    }

    fn remove(&mut self, queue: u16, mark: u32, ports: &[u16]) -> Result<()> {
        for &port in ports {
            for queue_bypass in [true, false] {
                let args = self.nfqueue_rule(port, queue, "-D", queue_bypass);
                let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                let _ = self.run(&args_refs);
            }
        }
        let exempt = self.mark_exempt_rule(mark, "-D");
        let exempt_refs: Vec<&str> = exempt.iter().map(String::as_str).collect();
        let _ = self.run(&exempt_refs);

        self.installed = false;
        Ok(())
    }
}
