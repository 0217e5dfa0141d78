//! Local control-plane socket: a lifecycle state machine, firewall rule
//! install/tear-down, and a newline-delimited JSON command dispatcher
//! wired to the queue worker and bypass engine.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

use desync_proto::{BypassSettings, BypassStats, StatsSnapshot, Whitelist};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::engine::BypassEngine;
use crate::error::{DesyncError, Result};
use crate::firewall::FirewallManager;
use crate::queue_worker::QueueWorker;
use crate::raw_injector::INJECTOR_MARK;

const BYPASS_PORTS: [u16; 2] = [80, 443];
const SOCKET_PERMISSIONS: u32 = 0o666;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Running,
}

#[derive(Debug, Deserialize)]
struct Request {
    cmd: String,
    /// Hostname argument for `whitelist_add`/`whitelist_remove`.
    hostname: Option<String>,
    #[serde(flatten)]
    settings_patch: SettingsPatch,
}

/// All `BypassSettings` fields as options, so a `settings` request can
/// update a subset (or query with none set) without clobbering the rest.
#[derive(Debug, Default, Deserialize)]
struct SettingsPatch {
    method: Option<desync_proto::BypassMethod>,
    first_split_offset: Option<usize>,
    inter_fragment_delay_ms: Option<u64>,
    fragment_count: Option<usize>,
    desync_https: Option<bool>,
    desync_http: Option<bool>,
    mix_host_case: Option<bool>,
    block_quic: Option<bool>,
}

impl SettingsPatch {
    fn apply_to(&self, settings: &mut BypassSettings) {
        if let Some(v) = self.method {
            settings.method = v;
        }
        if let Some(v) = self.first_split_offset {
            settings.first_split_offset = v;
        }
        if let Some(v) = self.inter_fragment_delay_ms {
            settings.inter_fragment_delay_ms = v;
        }
        if let Some(v) = self.fragment_count {
            settings.fragment_count = v;
        }
        if let Some(v) = self.desync_https {
            settings.desync_https = v;
        }
        if let Some(v) = self.desync_http {
            settings.desync_http = v;
        }
        if let Some(v) = self.mix_host_case {
            settings.mix_host_case = v;
        }
        if let Some(v) = self.block_quic {
            settings.block_quic = v;
        }
        settings.normalize();
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Response {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<StatsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    settings: Option<BypassSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    whitelist: Option<Vec<String>>,
}

impl Response {
    fn ok() -> Self {
        Response { status: "ok".to_string(), ..Default::default() }
    }

    fn error(message: impl Into<String>) -> Self {
        Response { status: "error".to_string(), message: Some(message.into()), ..Default::default() }
    }
}

struct RunningWorker {
    worker: Arc<QueueWorker>,
    join: thread::JoinHandle<()>,
}

/// Wires together settings, stats, whitelist, firewall, and the queue
/// worker/bypass engine lifecycle behind one mutex-protected state machine,
/// driven entirely by commands arriving over the control socket.
pub struct ControlPlane {
    state: Mutex<DaemonState>,
    queue_num: u16,
    settings: Arc<Mutex<BypassSettings>>,
    stats: Arc<BypassStats>,
    whitelist: Arc<Mutex<Whitelist>>,
    firewall: Mutex<Box<dyn FirewallManager>>,
    running_worker: Mutex<Option<RunningWorker>>,
    /// Set by `main` after construction so `exit` can remove the PID file
    /// and socket before the process terminates; left `None` in tests.
    cleanup_paths: Mutex<Option<(std::path::PathBuf, std::path::PathBuf)>>,
}

impl ControlPlane {
    pub fn new(queue_num: u16, firewall: Box<dyn FirewallManager>, initial_settings: BypassSettings) -> Self {
        let mut initial_settings = initial_settings;
        initial_settings.normalize();
        ControlPlane {
            state: Mutex::new(DaemonState::Stopped),
            queue_num,
            settings: Arc::new(Mutex::new(initial_settings)),
            stats: Arc::new(BypassStats::new()),
            whitelist: Arc::new(Mutex::new(Whitelist::new())),
            firewall: Mutex::new(firewall),
            running_worker: Mutex::new(None),
            cleanup_paths: Mutex::new(None),
        }
    }

    pub fn set_cleanup_paths(&self, pid_file: std::path::PathBuf, socket_path: std::path::PathBuf) {
        *self.cleanup_paths.lock().expect("cleanup_paths mutex poisoned") = Some((pid_file, socket_path));
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock().expect("state mutex poisoned") == DaemonState::Running
    }

    /// Starts the bypass immediately, equivalent to a client sending
    /// `{"cmd":"start"}` as the first request (the `--autostart` flag).
    /// Returns an error message on failure rather than a typed error: a
    /// failed autostart is reported through the same channel a client's
    /// `start` failure would be. An autostart failure is a fatal setup
    /// error for the process, surfaced to `main` as a plain string.
    pub fn autostart(&self) -> std::result::Result<(), String> {
        let resp = self.cmd_start();
        if resp.status == "ok" {
            Ok(())
        } else {
            Err(resp.message.unwrap_or_else(|| "start failed".to_string()))
        }
    }

    /// Binds a `0666` Unix-domain socket at `path`, replacing any stale
    /// socket file left behind by an unclean previous exit.
    pub fn bind_socket(path: &Path) -> Result<UnixListener> {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| DesyncError::ControlSocket(format!("bind {}: {e}", path.display())))?;
        let perms = std::fs::Permissions::from_mode(SOCKET_PERMISSIONS);
        std::fs::set_permissions(path, perms)
            .map_err(|e| DesyncError::ControlSocket(format!("chmod {}: {e}", path.display())))?;
        Ok(listener)
    }

    /// Accepts connections forever, handling each on the calling thread —
    /// commands are small and quick, so no connection pool is needed.
    pub fn accept_loop(self: &Arc<Self>, listener: UnixListener) {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => {
                    let plane = Arc::clone(self);
                    if let Err(err) = plane.handle_connection(stream) {
                        warn!(%err, "control connection ended with an error");
                    }
                }
                Err(err) => warn!(%err, "failed to accept control connection"),
            }
        }
    }

    fn handle_connection(&self, stream: UnixStream) -> std::io::Result<()> {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                return Ok(());
            }
            let response = self.dispatch(line.trim_end());
            let mut body = serde_json::to_string(&response).unwrap_or_else(|_| {
                "{\"status\":\"error\",\"message\":\"failed to encode response\"}".to_string()
            });
            body.push('\n');
            writer.write_all(body.as_bytes())?;
        }
    }

    fn dispatch(&self, line: &str) -> Response {
        let req: Request = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => return Response::error(format!("malformed request: {e}")),
        };

        match req.cmd.as_str() {
            "ping" => Response::ok(),
            "start" => self.cmd_start(),
            "stop" => self.cmd_stop(),
            "status" => self.cmd_status(),
            "settings" => self.cmd_settings(req.settings_patch),
            "whitelist_add" => self.cmd_whitelist_add(req.hostname),
            "whitelist_remove" => self.cmd_whitelist_remove(req.hostname),
            "whitelist_list" => self.cmd_whitelist_list(),
            "whitelist_clear" => self.cmd_whitelist_clear(),
            "stats_reset" => self.cmd_stats_reset(),
            "exit" => {
                let _ = self.cmd_stop();
                if let Some((pid_file, socket_path)) =
                    self.cleanup_paths.lock().expect("cleanup_paths mutex poisoned").take()
                {
                    let _ = std::fs::remove_file(&pid_file);
                    let _ = std::fs::remove_file(&socket_path);
                }
                std::process::exit(0);
            }
            other => Response::error(format!("unknown command: {other}")),
        }
    }

    fn cmd_start(&self) -> Response {
        let mut state = self.state.lock().expect("state mutex poisoned");
        if *state == DaemonState::Running {
            return Response::ok();
        }

        // Clear any stale rules before installing fresh ones, even on the
        // very first start.
        {
            let mut fw = self.firewall.lock().expect("firewall mutex poisoned");
            let _ = fw.remove(self.queue_num, INJECTOR_MARK, &BYPASS_PORTS);
            if let Err(e) = fw.install(self.queue_num, INJECTOR_MARK, &BYPASS_PORTS) {
                return Response::error(e.to_string());
            }
        }

        let worker = match QueueWorker::init(self.queue_num) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                let mut fw = self.firewall.lock().expect("firewall mutex poisoned");
                let _ = fw.remove(self.queue_num, INJECTOR_MARK, &BYPASS_PORTS);
                return Response::error(e.to_string());
            }
        };

        let engine = Arc::new(BypassEngine::new(
            Arc::clone(&self.settings),
            Arc::clone(&self.stats),
            Arc::clone(&self.whitelist),
        ));

        let thread_worker = Arc::clone(&worker);
        let join = thread::spawn(move || {
            thread_worker.run(engine.as_ref());
        });

        *self.running_worker.lock().expect("running_worker mutex poisoned") =
            Some(RunningWorker { worker, join });
        *state = DaemonState::Running;
        info!(queue = self.queue_num, "daemon started");
        Response::ok()
    }

    fn cmd_stop(&self) -> Response {
        let mut state = self.state.lock().expect("state mutex poisoned");
        if *state == DaemonState::Stopped {
            return Response::ok();
        }

        if let Some(running) = self.running_worker.lock().expect("running_worker mutex poisoned").take() {
            running.worker.stop();
            running.worker.cleanup();
            if running.join.join().is_err() {
                error!("queue worker thread panicked");
            }
        }

        let mut fw = self.firewall.lock().expect("firewall mutex poisoned");
        if let Err(e) = fw.remove(self.queue_num, INJECTOR_MARK, &BYPASS_PORTS) {
            warn!(%e, "failed to remove firewall rules on stop");
        }

        *state = DaemonState::Stopped;
        info!("daemon stopped");
        Response::ok()
    }

    fn cmd_status(&self) -> Response {
        Response {
            status: "ok".to_string(),
            running: Some(self.is_running()),
            stats: Some(self.stats.snapshot()),
            ..Default::default()
        }
    }

    fn cmd_settings(&self, patch: SettingsPatch) -> Response {
        let mut settings = self.settings.lock().expect("settings mutex poisoned");
        patch.apply_to(&mut settings);
        Response { status: "ok".to_string(), settings: Some(settings.clone()), ..Default::default() }
    }

    fn cmd_whitelist_add(&self, hostname: Option<String>) -> Response {
        let Some(hostname) = hostname else {
            return Response::error("whitelist_add requires a \"hostname\" field");
        };
        let mut whitelist = self.whitelist.lock().expect("whitelist mutex poisoned");
        match whitelist.insert(&hostname) {
            Ok(()) => Response::ok(),
            Err(e) => Response::error(e.to_string()),
        }
    }

    fn cmd_whitelist_remove(&self, hostname: Option<String>) -> Response {
        let Some(hostname) = hostname else {
            return Response::error("whitelist_remove requires a \"hostname\" field");
        };
        let mut whitelist = self.whitelist.lock().expect("whitelist mutex poisoned");
        whitelist.remove(&hostname);
        Response::ok()
    }

    fn cmd_whitelist_list(&self) -> Response {
        let whitelist = self.whitelist.lock().expect("whitelist mutex poisoned");
        Response {
            status: "ok".to_string(),
            whitelist: Some(whitelist.entries().to_vec()),
            ..Default::default()
        }
    }

    fn cmd_whitelist_clear(&self) -> Response {
        self.whitelist.lock().expect("whitelist mutex poisoned").clear();
        Response::ok()
    }

    fn cmd_stats_reset(&self) -> Response {
        self.stats.reset();
        Response::ok()
    }
}
