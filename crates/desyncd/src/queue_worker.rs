//! Netfilter-queue ingress: binds to a numbered NFQUEUE over
//! `NETLINK_NETFILTER`, receives packet messages, and dispatches verdicts.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{debug, trace, warn};

use crate::engine::{Packet, Verdict};
use crate::error::{DesyncError, Result};
use crate::netlink::{
    self, cfg_cmd_body, cfg_params_body, for_each_attr, for_each_message, verdict_hdr_body,
    NFNL_SUBSYS_QUEUE, NFQA_CFG_CMD, NFQA_CFG_PARAMS, NFQA_MARK, NFQA_PACKET_HDR, NFQA_PAYLOAD,
    NFQA_VERDICT_HDR, NFQNL_CFG_CMD_BIND, NFQNL_CFG_CMD_PF_BIND, NFQNL_CFG_CMD_PF_UNBIND,
    NFQNL_CFG_CMD_UNBIND, NFQNL_COPY_PACKET, NFQNL_MSG_CONFIG, NFQNL_MSG_PACKET, NFQNL_MSG_VERDICT,
    NLMSG_DONE, NLMSG_ERROR,
};

/// Anything that can turn a borrowed [`Packet`] into a verdict. The queue
/// worker invokes this by trait object, removing the need for the queue
/// worker to know about the bypass engine's internals.
pub trait PacketHandler: Send + Sync {
    fn handle(&self, packet: &Packet<'_>) -> Verdict;
}

impl PacketHandler for crate::engine::BypassEngine {
    fn handle(&self, packet: &Packet<'_>) -> Verdict {
        self.process(packet)
    }
}

const RECV_BUF_LEN: usize = 64 * 1024;
const SEND_BUF_LEN: usize = 4 * 1024;

/// Owns the netlink socket. `run` blocks the calling thread; `stop` is
/// `&self` so a different thread (the control-plane acceptor) can unblock
/// it by shutting the socket down — `QueueWorker` is held behind an `Arc`
/// so both sides share one instance.
pub struct QueueWorker {
    fd: RawFd,
    queue_num: u16,
    running: AtomicBool,
    messages_seen: AtomicU64,
}

impl QueueWorker {
    /// Opens the netlink socket and completes the PF_UNBIND / PF_BIND /
    /// BIND(queue) / CFG_PARAMS handshake. Any rejected step fails
    /// initialization with a human-readable reason.
    pub fn init(queue_num: u16) -> Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, netlink::NETLINK_NETFILTER) };
        if fd < 0 {
            return Err(DesyncError::NetlinkInit(io::Error::last_os_error().to_string()));
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_pid = std::process::id();
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(DesyncError::NetlinkInit(format!("bind: {err}")));
        }

        for (opt, len) in [(libc::SO_RCVBUF, RECV_BUF_LEN), (libc::SO_SNDBUF, SEND_BUF_LEN)] {
            let len = len as libc::c_int;
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    opt,
                    &len as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
        }

        let worker = QueueWorker {
            fd,
            queue_num,
            running: AtomicBool::new(true),
            messages_seen: AtomicU64::new(0),
        };

        worker
            .send_config_command(NFQNL_CFG_CMD_PF_UNBIND, libc::AF_INET as u16)
            .map_err(|e| DesyncError::QueueBind { queue: queue_num, reason: format!("PF_UNBIND: {e}") })?;
        worker
            .send_config_command(NFQNL_CFG_CMD_PF_BIND, libc::AF_INET as u16)
            .map_err(|e| DesyncError::QueueBind { queue: queue_num, reason: format!("PF_BIND: {e}") })?;
        worker
            .send_config_command(NFQNL_CFG_CMD_BIND, libc::AF_INET as u16)
            .map_err(|e| DesyncError::QueueBind { queue: queue_num, reason: format!("BIND: {e}") })?;
        worker
            .send_config_params()
            .map_err(|e| DesyncError::QueueBind { queue: queue_num, reason: format!("CFG_PARAMS: {e}") })?;

        debug!(queue_num, "queue worker bound");
        Ok(worker)
    }

    fn send_raw(&self, buf: &[u8]) -> io::Result<()> {
        let sent = unsafe { libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn send_config_command(&self, cmd: u8, pf: u16) -> io::Result<()> {
        let body = cfg_cmd_body(cmd, pf);
        let req = netlink::build_request(NFNL_SUBSYS_QUEUE, NFQNL_MSG_CONFIG, self.queue_num, &[(NFQA_CFG_CMD, &body)]);
        self.send_raw(&req)
    }

    fn send_config_params(&self) -> io::Result<()> {
        let body = cfg_params_body(netlink::COPY_RANGE_FULL, NFQNL_COPY_PACKET);
        let req = netlink::build_request(NFNL_SUBSYS_QUEUE, NFQNL_MSG_CONFIG, self.queue_num, &[(NFQA_CFG_PARAMS, &body)]);
        self.send_raw(&req)
    }

    /// Clears the running flag and shuts the socket down to unblock a
    /// blocked `recv`. Idempotent: repeated calls after the worker has
    /// already stopped are harmless.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
        }
    }

    /// Sends `CFG_CMD_UNBIND`. Call after `run` has returned; the socket
    /// itself closes when the last `Arc<QueueWorker>` is dropped.
    pub fn cleanup(&self) {
        let _ = self.send_config_command(NFQNL_CFG_CMD_UNBIND, libc::AF_INET as u16);
    }

    fn send_verdict(&self, packet_id: u32, verdict: Verdict) -> io::Result<()> {
        let body = verdict_hdr_body(verdict.as_u32(), packet_id);
        let req = netlink::build_request(NFNL_SUBSYS_QUEUE, NFQNL_MSG_VERDICT, self.queue_num, &[(NFQA_VERDICT_HDR, &body)]);
        self.send_raw(&req)
    }

    /// The dispatch loop. Blocks on `recv` until data arrives or `stop`
    /// unblocks it; returns once the running flag is cleared.
    pub fn run(&self, handler: &dyn PacketHandler) {
        let mut recv_buf = vec![0u8; RECV_BUF_LEN];
        while self.running.load(Ordering::SeqCst) {
            let n = unsafe {
                libc::recv(self.fd, recv_buf.as_mut_ptr() as *mut libc::c_void, recv_buf.len(), 0)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                    _ => {
                        if self.running.load(Ordering::SeqCst) {
                            warn!(%err, "recv on netlink socket failed");
                        }
                        break;
                    }
                }
            }
            if n == 0 || !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.dispatch(&recv_buf[..n as usize], handler);
        }
    }

    fn dispatch(&self, buf: &[u8], handler: &dyn PacketHandler) {
        for_each_message(buf, |msg| {
            if msg.msg_type() == NLMSG_ERROR as u8 && msg.subsystem() == 0 {
                warn!("netlink reported an error on a previous request");
                return;
            }
            if msg.msg_type() == NLMSG_DONE as u8 && msg.subsystem() == 0 {
                return;
            }
            if msg.subsystem() != NFNL_SUBSYS_QUEUE || msg.msg_type() != NFQNL_MSG_PACKET {
                return;
            }

            let mut packet_id = None;
            let mut mark = None;
            let mut payload: Option<&[u8]> = None;

            for_each_attr(msg.body, |attr_type, attr_body| {
                if attr_type == NFQA_PACKET_HDR && attr_body.len() >= 4 {
                    packet_id = Some(u32::from_be_bytes([attr_body[0], attr_body[1], attr_body[2], attr_body[3]]));
                } else if attr_type == NFQA_MARK && attr_body.len() >= 4 {
                    mark = Some(u32::from_be_bytes([attr_body[0], attr_body[1], attr_body[2], attr_body[3]]));
                } else if attr_type == NFQA_PAYLOAD {
                    payload = Some(attr_body);
                }
            });

            let (Some(id), Some(raw)) = (packet_id, payload) else {
                return;
            };

            let seen = self.messages_seen.fetch_add(1, Ordering::Relaxed) + 1;
            trace!(messages_seen = seen, "netlink message reached dispatch");

            let packet = Packet { id, mark, raw };
            let verdict = handler.handle(&packet);
            debug!(queue_num = self.queue_num, len = raw.len(), ?verdict, "dispatched packet");
            if verdict != Verdict::Stolen {
                if let Err(err) = self.send_verdict(id, verdict) {
                    warn!(%err, id, "failed to send verdict");
                }
            }
        });
    }
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}
