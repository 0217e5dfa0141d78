//! Owns a raw `IP_HDRINCL` socket used to inject fully-formed IPv4 fragments.
//!
//! State machine: `Uninitialized -> Initialized -> Closed`. `init` is
//! idempotent; `send` performs no mutation of the caller's bytes.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;

use tracing::{debug, warn};

/// `SO_MARK` applied to every packet this socket emits, so the firewall rule
/// that diverts traffic into the NFQUEUE can exempt our own injected
/// fragments.
pub const INJECTOR_MARK: u32 = 0x0010_DEAD;

#[derive(Debug, PartialEq, Eq)]
enum State {
    Uninitialized,
    Initialized,
    Closed,
}

#[derive(Debug)]
pub struct RawInjector {
    state: State,
    fd: Option<RawFd>,
}

impl Default for RawInjector {
    fn default() -> Self {
        RawInjector {
            state: State::Uninitialized,
            fd: None,
        }
    }
}

impl RawInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.state == State::Initialized
    }

    /// Creates the raw socket, enables `IP_HDRINCL`, and best-effort sets
    /// `SO_MARK`. Idempotent: a second call while already `Initialized` is a
    /// no-op success.
    pub fn init(&mut self) -> io::Result<()> {
        if self.state == State::Initialized {
            return Ok(());
        }
        // SAFETY: straightforward libc socket-creation calls with
        // statically-correct argument types; every result is checked.
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_RAW) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let on: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_HDRINCL,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let mark = INJECTOR_MARK as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_MARK,
                &mark as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            // Best-effort: a kernel without CAP_NET_ADMIN for SO_MARK (or an
            // older kernel) shouldn't stop injection from working; the
            // firewall rule just won't be able to exempt these fragments.
            warn!(error = %io::Error::last_os_error(), "failed to set SO_MARK on raw injector socket");
        }

        self.fd = Some(fd);
        self.state = State::Initialized;
        debug!("raw injector initialized");
        Ok(())
    }

    /// Sends one fully-formed IPv4 datagram. The caller guarantees the bytes
    /// are a well-formed packet (checksum-correct headers); this function
    /// performs no mutation. Returns `Ok(())` iff the kernel accepted the
    /// full length.
    pub fn send(&mut self, packet: &[u8], dst: Ipv4Addr) -> io::Result<()> {
        let fd = self.fd.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "raw injector not initialized")
        })?;

        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = u32::from_ne_bytes(dst.octets());

        let sent = unsafe {
            libc::sendto(
                fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
                0,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        if sent as usize != packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write on raw injector socket",
            ));
        }
        Ok(())
    }

    /// Closes the socket and transitions to `Closed`. Idempotent.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            unsafe { libc::close(fd) };
        }
        self.state = State::Closed;
    }
}

impl Drop for RawInjector {
    fn drop(&mut self) {
        self.close();
    }
}
