//! Pure, OS-independent protocol logic for `desyncd`: IPv4/TCP header
//! parsing and checksums, TLS SNI / HTTP `Host:` classification, the
//! fragment builder, and the shared settings/stats/whitelist data types.
//!
//! Nothing here touches a socket, a netlink message, or the filesystem —
//! that lives in `desyncd`, which depends on this crate.

#![forbid(unsafe_code)]

pub mod classify;
pub mod fragment;
pub mod ip;
pub mod settings;
pub mod stats;
pub mod tcp;
pub mod whitelist;

pub use classify::{extract_http_host, extract_sni, host_header_offset, is_http_request, is_tls_client_hello};
pub use fragment::{build_fragment, build_fragments, disorder_points, mix_host_case, split_points, Fragment};
pub use ip::{internet_checksum, IpError, IpProtocol, Ipv4View};
pub use settings::{BypassMethod, BypassSettings};
pub use stats::{BypassStats, StatsSnapshot};
pub use tcp::{tcp_checksum, TcpError, TcpFlags, TcpView};
pub use whitelist::{Whitelist, WhitelistError};
