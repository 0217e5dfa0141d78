//! Splits a TCP segment's payload into checksum-correct sibling fragments.
//!
//! `fragment_index` assignment is fixed (resolved Open Question): siblings
//! are numbered `0..N` in ascending payload-offset order regardless of the
//! order the caller eventually transmits them in, and `id_delta` for
//! sibling `i` is exactly `i`. Callers that want `*_REVERSE` semantics
//! reorder the returned `Vec` for transmission; they must not renumber it.

use crate::classify::host_header_offset;
use crate::ip::{set_identification, set_ip_checksum, set_total_length, Ipv4View};
use crate::settings::{BypassMethod, BypassSettings};
use crate::tcp::{set_tcp_checksum_raw, TcpView};

/// One fragment ready for injection, plus the bookkeeping an engine or test
/// needs without re-parsing the bytes.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub bytes: Vec<u8>,
    /// Byte offset of this fragment's payload within the original payload.
    pub payload_offset: usize,
    pub payload_len: usize,
    pub fragment_index: u16,
}

/// Builds one fragment: original IP+TCP headers verbatim, `sub_payload`
/// appended, with `IP.total_length`/`IP.id`/`IP.checksum` and
/// `TCP.seq`/`TCP.checksum` rewritten to match.
pub fn build_fragment(
    ip: &Ipv4View<'_>,
    tcp: &TcpView<'_>,
    sub_payload: &[u8],
    seq_offset: u32,
    fragment_index: u16,
) -> Vec<u8> {
    let ip_hdr_len = ip.header_len();
    let tcp_hdr_len = tcp.header_len();
    let total_len = ip_hdr_len + tcp_hdr_len + sub_payload.len();
    let src = ip.source();
    let dst = ip.destination();
    let orig_id = ip.identification();
    let orig_seq = tcp.sequence();

    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(ip.header_bytes());
    out.extend_from_slice(tcp.header_bytes());
    out.extend_from_slice(sub_payload);

    set_total_length(&mut out[..ip_hdr_len], total_len as u16);
    set_identification(&mut out[..ip_hdr_len], orig_id.wrapping_add(fragment_index));
    set_ip_checksum(&mut out[..ip_hdr_len]);

    let new_seq = orig_seq.wrapping_add(seq_offset);
    out[ip_hdr_len + 4..ip_hdr_len + 8].copy_from_slice(&new_seq.to_be_bytes());

    set_tcp_checksum_raw(src, dst, &mut out[ip_hdr_len..]);

    out
}

/// Returns the two payload ranges SPLIT uses: `[0, k)` and `[k, n)`, where
/// `k = clamp(first_split_offset, 1, n-1)`, falling back to `n/2` when the
/// configured offset can't produce two non-empty halves (e.g. `n <= 1`).
pub fn split_points(payload_len: usize, first_split_offset: usize) -> Vec<(usize, usize)> {
    if payload_len < 2 {
        return vec![(0, payload_len)];
    }
    let k = if first_split_offset >= 1 && first_split_offset <= payload_len - 1 {
        first_split_offset
    } else {
        payload_len / 2
    };
    let k = k.clamp(1, payload_len - 1);
    vec![(0, k), (k, payload_len)]
}

/// Returns `c` payload ranges for DISORDER, `c = clamp(fragment_count, 2,
/// 10)`, each of size `n/c` except the last which absorbs the remainder.
pub fn disorder_points(payload_len: usize, fragment_count: usize) -> Vec<(usize, usize)> {
    let c = fragment_count.clamp(
        crate::settings::MIN_FRAGMENT_COUNT,
        crate::settings::MAX_FRAGMENT_COUNT,
    );
    if payload_len == 0 {
        return vec![(0, 0)];
    }
    let c = c.min(payload_len.max(1));
    let chunk = payload_len / c;
    let mut ranges = Vec::with_capacity(c);
    let mut start = 0;
    for i in 0..c {
        let end = if i == c - 1 { payload_len } else { start + chunk };
        ranges.push((start, end));
        start = end;
    }
    ranges
}

/// Alternates the case of ASCII-alphabetic bytes within the `Host:` header's
/// value (not the header name itself), in place. No-op if no `Host:` header
/// is present. Matches bytes in the original, pre-split payload since
/// fragment ranges partition it without overlap.
pub fn mix_host_case(payload: &mut [u8]) {
    let Some(header_pos) = host_header_offset(payload) else {
        return;
    };
    let mut i = header_pos + "host:".len();
    while i < payload.len() && payload[i] == b' ' {
        i += 1;
    }
    let mut end = i;
    while end < payload.len() && payload[end] != b'\r' && payload[end] != b'\n' {
        end += 1;
    }
    let mut flip_upper = false;
    for b in &mut payload[i..end] {
        if b.is_ascii_alphabetic() {
            *b = if flip_upper {
                b.to_ascii_uppercase()
            } else {
                b.to_ascii_lowercase()
            };
            flip_upper = !flip_upper;
        }
    }
}

/// Builds the full sibling set for `method` over `payload`, in ascending
/// payload-offset order. Returns a single whole-payload fragment for
/// `BypassMethod::None` (callers should not normally invoke the builder for
/// `None`, but this keeps the function total).
pub fn build_fragments(
    ip: &Ipv4View<'_>,
    tcp: &TcpView<'_>,
    payload: &[u8],
    settings: &BypassSettings,
) -> Vec<Fragment> {
    let mut mutable_payload = payload.to_vec();
    if settings.mix_host_case {
        mix_host_case(&mut mutable_payload);
    }
    let payload = mutable_payload.as_slice();

    let ranges = match settings.method {
        BypassMethod::None => vec![(0, payload.len())],
        BypassMethod::Split | BypassMethod::SplitReverse => {
            split_points(payload.len(), settings.first_split_offset)
        }
        BypassMethod::Disorder | BypassMethod::DisorderReverse => {
            disorder_points(payload.len(), settings.fragment_count)
        }
    };

    ranges
        .into_iter()
        .enumerate()
        .map(|(index, (start, end))| {
            let sub = &payload[start..end];
            let fragment_index = index as u16;
            let bytes = build_fragment(ip, tcp, sub, start as u32, fragment_index);
            Fragment {
                bytes,
                payload_offset: start,
                payload_len: end - start,
                fragment_index,
            }
        })
        .collect()
}
