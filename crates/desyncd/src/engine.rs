//! Glues the header codec, classifier, and fragment builder into the
//! per-packet decision: classify, choose a method, emit fragments, decide
//! a verdict.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use desync_proto::{
    build_fragments, extract_http_host, extract_sni, is_http_request, is_tls_client_hello,
    BypassMethod, BypassSettings, BypassStats, IpProtocol, Ipv4View, TcpView, Whitelist,
};
use tracing::{debug, trace};

use crate::raw_injector::RawInjector;

/// Verdict values match the netfilter_queue wire constants directly
/// (`DROP=0, ACCEPT=1, STOLEN=3, REPEAT=4`) so the queue worker can write
/// them straight into a `VERDICT_HDR` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Drop = 0,
    Accept = 1,
    Stolen = 3,
    Repeat = 4,
}

impl Verdict {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// A borrowed view over one kernel-delivered packet, as handed to the
/// engine by the queue worker. Never escapes the dispatch call; the engine
/// must not retain `raw` past `process`'s return.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub id: u32,
    pub mark: Option<u32>,
    pub raw: &'a [u8],
}

/// Shared, mutex-protected bypass configuration plus the lazily-initialized
/// raw injector. Owned by one `BypassEngine`, which the control plane and
/// queue worker both hold a clone of (`Arc`).
pub struct BypassEngine {
    pub settings: Arc<Mutex<BypassSettings>>,
    pub stats: Arc<BypassStats>,
    pub whitelist: Arc<Mutex<Whitelist>>,
    injector: Mutex<RawInjector>,
}

impl BypassEngine {
    pub fn new(
        settings: Arc<Mutex<BypassSettings>>,
        stats: Arc<BypassStats>,
        whitelist: Arc<Mutex<Whitelist>>,
    ) -> Self {
        BypassEngine {
            settings,
            stats,
            whitelist,
            injector: Mutex::new(RawInjector::new()),
        }
    }

    fn settings_snapshot(&self) -> BypassSettings {
        self.settings.lock().expect("settings mutex poisoned").clone()
    }

    fn is_whitelisted(&self, hostname: &str) -> bool {
        self.whitelist
            .lock()
            .expect("whitelist mutex poisoned")
            .matches(hostname)
    }

    /// Entry point for one packet. Never panics on malformed input — every
    /// failure path degrades to `Verdict::Accept`, per this daemon's
    /// never-fatal error-handling policy.
    pub fn process(&self, packet: &Packet<'_>) -> Verdict {
        let Ok(ip) = Ipv4View::parse(packet.raw) else {
            return Verdict::Accept;
        };
        self.stats.record_packet(packet.raw.len() as u64);

        let settings = self.settings_snapshot();

        if settings.block_quic
            && ip.protocol() == IpProtocol::Udp
            && matches!(dest_port_of_udp(&ip, packet.raw), Some(443) | Some(80))
        {
            self.stats.record_dropped();
            return Verdict::Drop;
        }

        if ip.protocol() != IpProtocol::Tcp {
            return Verdict::Accept;
        }

        let tcp_bytes = &packet.raw[ip.header_len()..ip.total_length() as usize];
        let Ok(tcp) = TcpView::parse(tcp_bytes) else {
            return Verdict::Accept;
        };
        let payload = tcp.payload();
        if payload.is_empty() {
            return Verdict::Accept;
        }

        let hostname = match tcp.dest_port() {
            443 if settings.desync_https && is_tls_client_hello(payload) => extract_sni(payload),
            80 if settings.desync_http && is_http_request(payload) => extract_http_host(payload),
            _ => return Verdict::Accept,
        };

        if let Some(host) = &hostname {
            if self.is_whitelisted(host) {
                return Verdict::Accept;
            }
        }

        if settings.method == BypassMethod::None {
            return Verdict::Accept;
        }

        {
            let mut injector = self.injector.lock().expect("injector mutex poisoned");
            if injector.init().is_err() {
                return Verdict::Accept;
            }
        }

        let fragments = build_fragments(&ip, &tcp, payload, &settings);
        let dst = Ipv4Addr::from(ip.destination().to_be_bytes());

        let send_order: Vec<usize> = match settings.method {
            BypassMethod::SplitReverse | BypassMethod::DisorderReverse => {
                (0..fragments.len()).rev().collect()
            }
            _ => (0..fragments.len()).collect(),
        };

        let mut injector = self.injector.lock().expect("injector mutex poisoned");
        for (i, &idx) in send_order.iter().enumerate() {
            if let Err(err) = injector.send(&fragments[idx].bytes, dst) {
                debug!(%err, "fragment injection failed, failing open");
                return Verdict::Accept;
            }
            if i + 1 < send_order.len() && settings.inter_fragment_delay_ms > 0 {
                thread::sleep(Duration::from_millis(settings.inter_fragment_delay_ms));
            }
        }
        drop(injector);

        self.stats.record_bypassed();
        trace!(hostname = ?hostname, method = ?settings.method, fragments = fragments.len(), "bypassed connection");
        Verdict::Drop
    }
}

/// Best-effort destination-port extraction for a UDP datagram, used only by
/// the QUIC-block check; returns `None` on anything short or malformed
/// rather than treating it as eligible.
fn dest_port_of_udp(ip: &Ipv4View<'_>, raw: &[u8]) -> Option<u16> {
    let start = ip.header_len();
    if raw.len() < start + 4 {
        return None;
    }
    Some(u16::from_be_bytes([raw[start + 2], raw[start + 3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use desync_proto::Whitelist;

    fn ip_header(total_len: u16, proto: u8, dst: [u8; 4]) -> Vec<u8> {
        let mut h = vec![
            0x45, 0x00, 0x00, 0x00, 0x00, 0x01, 0x40, 0x00, 0x40, proto, 0x00, 0x00, 10, 0, 0, 1,
            0, 0, 0, 0,
        ];
        h[16..20].copy_from_slice(&dst);
        h[2..4].copy_from_slice(&total_len.to_be_bytes());
        desync_proto::ip::set_ip_checksum(&mut h);
        h
    }

    fn tcp_segment(dport: u16, payload: &[u8]) -> Vec<u8> {
        let mut t = vec![
            0x13, 0x88, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x50, 0x18,
            0x20, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        t[2..4].copy_from_slice(&dport.to_be_bytes());
        t.extend_from_slice(payload);
        t
    }

    fn make_engine() -> BypassEngine {
        BypassEngine::new(
            Arc::new(Mutex::new(BypassSettings::default())),
            Arc::new(BypassStats::new()),
            Arc::new(Mutex::new(Whitelist::new())),
        )
    }

    #[test]
    fn accepts_non_ipv4() {
        let engine = make_engine();
        let packet = Packet {
            id: 1,
            mark: None,
            raw: &[0xFF, 0xFF],
        };
        assert_eq!(engine.process(&packet), Verdict::Accept);
    }

    #[test]
    fn accepts_non_tcp_non_udp() {
        let engine = make_engine();
        let ip = ip_header(20, 1 /* ICMP */, [1, 2, 3, 4]);
        let packet = Packet { id: 1, mark: None, raw: &ip };
        assert_eq!(engine.process(&packet), Verdict::Accept);
    }

    #[test]
    fn accepts_control_segment_without_payload() {
        let engine = make_engine();
        let tcp = tcp_segment(443, &[]);
        let ip = ip_header((20 + tcp.len()) as u16, 6, [1, 2, 3, 4]);
        let mut raw = ip;
        raw.extend_from_slice(&tcp);
        let packet = Packet { id: 1, mark: None, raw: &raw };
        assert_eq!(engine.process(&packet), Verdict::Accept);
    }

    #[test]
    fn drops_quic_when_block_quic_enabled() {
        let engine = make_engine();
        engine.settings.lock().unwrap().block_quic = true;

        let mut udp = vec![0u8; 8];
        udp[2..4].copy_from_slice(&443u16.to_be_bytes());
        let ip = ip_header((20 + udp.len()) as u16, 17, [1, 2, 3, 4]);
        let mut raw = ip;
        raw.extend_from_slice(&udp);

        let packet = Packet { id: 1, mark: None, raw: &raw };
        assert_eq!(engine.process(&packet), Verdict::Drop);
        assert_eq!(engine.stats.snapshot().packets_dropped, 1);
    }

    #[test]
    fn accepts_non_http_https_port_without_classifying() {
        let engine = make_engine();
        let tcp = tcp_segment(22, b"SSH-2.0-OpenSSH");
        let ip = ip_header((20 + tcp.len()) as u16, 6, [1, 2, 3, 4]);
        let mut raw = ip;
        raw.extend_from_slice(&tcp);
        let packet = Packet { id: 1, mark: None, raw: &raw };
        assert_eq!(engine.process(&packet), Verdict::Accept);
        assert_eq!(engine.stats.snapshot().packets_total, 1, "every parsed packet counts, even on a port we never classify");
    }

    #[test]
    fn http_request_line_is_classified_when_desync_http_enabled() {
        let engine = make_engine();
        {
            let mut settings = engine.settings.lock().unwrap();
            settings.desync_http = true;
            settings.method = BypassMethod::None;
        }
        let tcp = tcp_segment(80, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let ip = ip_header((20 + tcp.len()) as u16, 6, [1, 2, 3, 4]);
        let mut raw = ip;
        raw.extend_from_slice(&tcp);
        let packet = Packet { id: 1, mark: None, raw: &raw };
        assert_eq!(engine.process(&packet), Verdict::Accept);
        assert_eq!(engine.stats.snapshot().packets_total, 1);
    }

    #[test]
    fn non_http_payload_on_port_80_is_never_classified() {
        let engine = make_engine();
        {
            let mut settings = engine.settings.lock().unwrap();
            settings.desync_http = true;
            settings.method = BypassMethod::None;
        }
        // Looks nothing like an HTTP request line, even though it happens to
        // contain the substring "Host:" past the start of the payload.
        // `is_http_request`'s own gating is covered in classify.rs; here we
        // only care that the engine still accepts and still counts the
        // packet as processed.
        let tcp = tcp_segment(80, b"\x00\x01garbageHost: example.com\r\n");
        let ip = ip_header((20 + tcp.len()) as u16, 6, [1, 2, 3, 4]);
        let mut raw = ip;
        raw.extend_from_slice(&tcp);
        let packet = Packet { id: 1, mark: None, raw: &raw };
        assert_eq!(engine.process(&packet), Verdict::Accept);
        assert_eq!(engine.stats.snapshot().packets_total, 1);
    }

    #[test]
    fn whitelisted_sni_short_circuits_to_accept() {
        let engine = make_engine();
        engine.whitelist.lock().unwrap().insert("github.com").unwrap();

        // Minimal ClientHello-shaped payload whose SNI is api.github.com.
        let hostname = "api.github.com";
        let mut sni_entry = vec![0x00];
        sni_entry.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
        sni_entry.extend_from_slice(hostname.as_bytes());
        let mut sni_ext_body = Vec::new();
        sni_ext_body.extend_from_slice(&(sni_entry.len() as u16).to_be_bytes());
        sni_ext_body.extend_from_slice(&sni_entry);
        let mut ext = vec![0x00, 0x00];
        ext.extend_from_slice(&(sni_ext_body.len() as u16).to_be_bytes());
        ext.extend_from_slice(&sni_ext_body);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]);
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut payload = vec![0x16, 0x03, 0x01];
        payload.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        payload.extend_from_slice(&handshake);

        let tcp = tcp_segment(443, &payload);
        let ip = ip_header((20 + tcp.len()) as u16, 6, [93, 184, 216, 34]);
        let mut raw = ip;
        raw.extend_from_slice(&tcp);

        let packet = Packet { id: 1, mark: None, raw: &raw };
        assert_eq!(engine.process(&packet), Verdict::Accept);
        assert_eq!(engine.stats.snapshot().packets_bypassed, 0);
    }
}
