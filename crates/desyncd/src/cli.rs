//! Command-line/environment configuration.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use desync_proto::{BypassMethod, BypassSettings};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliBypassMethod {
    None,
    Split,
    SplitReverse,
    Disorder,
    DisorderReverse,
}

impl From<CliBypassMethod> for BypassMethod {
    fn from(value: CliBypassMethod) -> Self {
        match value {
            CliBypassMethod::None => BypassMethod::None,
            CliBypassMethod::Split => BypassMethod::Split,
            CliBypassMethod::SplitReverse => BypassMethod::SplitReverse,
            CliBypassMethod::Disorder => BypassMethod::Disorder,
            CliBypassMethod::DisorderReverse => BypassMethod::DisorderReverse,
        }
    }
}

/// Startup flags. There is no persistent configuration file: every setting
/// is either a flag/env default here or set later over the control socket,
/// and settings live only in process memory, not on disk.
#[derive(Debug, Parser)]
#[command(name = "desyncd", about = "NFQUEUE-based DPI circumvention daemon")]
pub struct Cli {
    /// NFQUEUE queue number to bind.
    #[arg(long, env = "DESYNCD_QUEUE_NUM", default_value_t = 0)]
    pub queue_num: u16,

    /// Unix-domain control socket path.
    #[arg(long, env = "DESYNCD_SOCKET_PATH", default_value = "/run/desyncd/desyncd.sock")]
    pub socket_path: PathBuf,

    /// PID file path, written on startup and removed on clean exit.
    #[arg(long, env = "DESYNCD_PID_FILE", default_value = "/run/desyncd/desyncd.pid")]
    pub pid_file: PathBuf,

    /// Optional file to additionally append structured logs to.
    #[arg(long, env = "DESYNCD_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, env = "DESYNCD_LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Issue `start` immediately after binding the control socket, instead
    /// of waiting for a client command.
    #[arg(long, env = "DESYNCD_AUTOSTART")]
    pub autostart: bool,

    #[arg(long, value_enum, env = "DESYNCD_METHOD", default_value_t = CliBypassMethod::Split)]
    pub method: CliBypassMethod,

    #[arg(long, env = "DESYNCD_FIRST_SPLIT_OFFSET", default_value_t = 2)]
    pub first_split_offset: usize,

    #[arg(long, env = "DESYNCD_INTER_FRAGMENT_DELAY_MS", default_value_t = 50)]
    pub inter_fragment_delay_ms: u64,

    #[arg(long, env = "DESYNCD_FRAGMENT_COUNT", default_value_t = 4)]
    pub fragment_count: usize,

    #[arg(long, env = "DESYNCD_DESYNC_HTTPS", default_value_t = true)]
    pub desync_https: bool,

    #[arg(long, env = "DESYNCD_DESYNC_HTTP", default_value_t = false)]
    pub desync_http: bool,

    #[arg(long, env = "DESYNCD_MIX_HOST_CASE", default_value_t = false)]
    pub mix_host_case: bool,

    #[arg(long, env = "DESYNCD_BLOCK_QUIC", default_value_t = false)]
    pub block_quic: bool,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::fmt::Display for CliBypassMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CliBypassMethod::None => "none",
            CliBypassMethod::Split => "split",
            CliBypassMethod::SplitReverse => "split-reverse",
            CliBypassMethod::Disorder => "disorder",
            CliBypassMethod::DisorderReverse => "disorder-reverse",
        };
        write!(f, "{s}")
    }
}

impl Cli {
    pub fn initial_settings(&self) -> BypassSettings {
        let mut settings = BypassSettings {
            method: self.method.into(),
            first_split_offset: self.first_split_offset,
            inter_fragment_delay_ms: self.inter_fragment_delay_ms,
            fragment_count: self.fragment_count,
            desync_https: self.desync_https,
            desync_http: self.desync_http,
            mix_host_case: self.mix_host_case,
            block_quic: self.block_quic,
        };
        settings.normalize();
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sets a `DESYNCD_*` env var for the lifetime of the guard and restores
    /// whatever was there before on drop. `std::env::set_var` affects the
    /// whole process, and these tests run in parallel by default, so every
    /// test touching env vars must hold one of these for its full duration.
    struct EnvVarGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let previous = std::env::var(key).ok();
            std::env::set_var(key, value);
            EnvVarGuard { key, previous }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match &self.previous {
                Some(v) => std::env::set_var(self.key, v),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn defaults_parse_with_no_arguments() {
        let cli = Cli::parse_from(["desyncd"]);
        assert_eq!(cli.queue_num, 0);
        assert_eq!(cli.socket_path, PathBuf::from("/run/desyncd/desyncd.sock"));
        assert!(!cli.autostart);
        let settings = cli.initial_settings();
        assert_eq!(settings.method, BypassMethod::Split);
        assert!(settings.desync_https);
        assert!(!settings.desync_http);
    }

    #[test]
    fn overrides_take_effect() {
        let cli = Cli::parse_from([
            "desyncd",
            "--queue-num",
            "7",
            "--method",
            "disorder-reverse",
            "--autostart",
        ]);
        assert_eq!(cli.queue_num, 7);
        assert!(cli.autostart);
        assert_eq!(cli.initial_settings().method, BypassMethod::DisorderReverse);
    }

    #[test]
    fn env_vars_populate_defaults_and_flags_still_win() {
        let _queue = EnvVarGuard::set("DESYNCD_QUEUE_NUM", "9");
        let _method = EnvVarGuard::set("DESYNCD_METHOD", "disorder");
        let _quic = EnvVarGuard::set("DESYNCD_BLOCK_QUIC", "true");

        let cli = Cli::parse_from(["desyncd"]);
        assert_eq!(cli.queue_num, 9);
        assert_eq!(cli.initial_settings().method, BypassMethod::Disorder);
        assert!(cli.block_quic);

        // An explicit flag still overrides the env var.
        let cli = Cli::parse_from(["desyncd", "--queue-num", "3"]);
        assert_eq!(cli.queue_num, 3);
    }
}
