//! Netfilter-queue message framing over `NETLINK_NETFILTER`.
//!
//! This module owns only wire encoding/decoding — building request buffers
//! and walking response buffers. Socket lifecycle lives in
//! [`crate::queue_worker`].

pub const NETLINK_NETFILTER: libc::c_int = 12;

pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLM_F_REQUEST: u16 = 0x01;

pub const NFNL_SUBSYS_QUEUE: u8 = 3;

// nfqnl_msg_types
pub const NFQNL_MSG_PACKET: u8 = 0;
pub const NFQNL_MSG_VERDICT: u8 = 1;
pub const NFQNL_MSG_CONFIG: u8 = 2;

// nfqnl_msg_config_cmds
pub const NFQNL_CFG_CMD_BIND: u8 = 1;
pub const NFQNL_CFG_CMD_UNBIND: u8 = 2;
pub const NFQNL_CFG_CMD_PF_BIND: u8 = 3;
pub const NFQNL_CFG_CMD_PF_UNBIND: u8 = 4;

// nfqnl_attr_config
pub const NFQA_CFG_CMD: u16 = 1;
pub const NFQA_CFG_PARAMS: u16 = 2;

// nfqnl_attr_type (packet/verdict attributes)
pub const NFQA_PACKET_HDR: u16 = 1;
pub const NFQA_VERDICT_HDR: u16 = 2;
pub const NFQA_MARK: u16 = 3;
pub const NFQA_PAYLOAD: u16 = 10;

// nfqnl_config_mode
pub const NFQNL_COPY_PACKET: u8 = 2;
pub const COPY_RANGE_FULL: u32 = 0xFFFF;

const NLMSGHDR_LEN: usize = 16;
const NFGENMSG_LEN: usize = 4;
const NLA_HDR_LEN: usize = 4;

pub fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Packs `msg_type`'s subsystem/message nibble the way the kernel expects:
/// high byte is the nfnetlink subsystem, low byte the per-subsystem type.
pub fn nlmsg_type(subsys: u8, msg: u8) -> u16 {
    ((subsys as u16) << 8) | msg as u16
}

/// Builds one complete netlink request: `nlmsghdr || nfgenmsg || attrs`.
/// `attrs` is a list of `(attr_type, body)` pairs, each encoded as a
/// 4-byte-aligned `nlattr`.
pub fn build_request(subsys: u8, msg: u8, queue_num: u16, attrs: &[(u16, &[u8])]) -> Vec<u8> {
    let mut attrs_buf = Vec::new();
    for (attr_type, body) in attrs {
        put_attr(&mut attrs_buf, *attr_type, body);
    }

    let total_len = NLMSGHDR_LEN + NFGENMSG_LEN + attrs_buf.len();
    let mut buf = Vec::with_capacity(total_len);

    // nlmsghdr
    buf.extend_from_slice(&(total_len as u32).to_ne_bytes()); // nlmsg_len
    buf.extend_from_slice(&nlmsg_type(subsys, msg).to_ne_bytes()); // nlmsg_type
    buf.extend_from_slice(&NLM_F_REQUEST.to_ne_bytes()); // nlmsg_flags
    buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_seq
    buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid

    // nfgenmsg
    buf.push(libc::AF_UNSPEC as u8); // nfgen_family
    buf.push(0); // nfnetlink version
    buf.extend_from_slice(&queue_num.to_be_bytes()); // res_id (htons(queue_num))

    buf.extend_from_slice(&attrs_buf);
    buf
}

fn put_attr(buf: &mut Vec<u8>, attr_type: u16, body: &[u8]) {
    let len = (NLA_HDR_LEN + body.len()) as u16;
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(body);
    let padded = align4(body.len());
    for _ in body.len()..padded {
        buf.push(0);
    }
}

/// `CFG_CMD` attribute body: `{ pf: be16, _pad: u8, cmd: u8 }`.
pub fn cfg_cmd_body(cmd: u8, pf: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(4);
    body.extend_from_slice(&pf.to_be_bytes());
    body.push(0);
    body.push(cmd);
    body
}

/// `CFG_PARAMS` attribute body: `{ copy_range: be32, copy_mode: u8 }`.
pub fn cfg_params_body(copy_range: u32, copy_mode: u8) -> Vec<u8> {
    let mut body = Vec::with_capacity(5);
    body.extend_from_slice(&copy_range.to_be_bytes());
    body.push(copy_mode);
    body
}

/// `VERDICT_HDR` attribute body: `{ verdict: be32, id: be32 }`.
pub fn verdict_hdr_body(verdict: u32, id: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&verdict.to_be_bytes());
    body.extend_from_slice(&id.to_be_bytes());
    body
}

/// A parsed `nlmsghdr` plus the bytes of its body (everything past the
/// 16-byte header, up to `nlmsg_len`, never past the end of `buf`).
#[derive(Debug, Clone, Copy)]
pub struct NlMessage<'a> {
    pub nlmsg_type: u16,
    pub body: &'a [u8],
}

impl<'a> NlMessage<'a> {
    pub fn subsystem(&self) -> u8 {
        (self.nlmsg_type >> 8) as u8
    }

    pub fn msg_type(&self) -> u8 {
        (self.nlmsg_type & 0xFF) as u8
    }
}

/// Walks consecutive `nlmsghdr`s in `buf`, yielding each message whose
/// `nlmsg_len` fits within the remaining buffer. Never reads past
/// `nlmsg_len`, and `nlmsg_len` is itself bounds-checked against `buf`.
pub fn for_each_message<'a>(buf: &'a [u8], mut f: impl FnMut(NlMessage<'a>)) {
    let mut pos = 0usize;
    while pos + NLMSGHDR_LEN <= buf.len() {
        let nlmsg_len = u32::from_ne_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        if nlmsg_len < NLMSGHDR_LEN || pos + nlmsg_len > buf.len() {
            break;
        }
        let msg_type = u16::from_ne_bytes(buf[pos + 4..pos + 6].try_into().unwrap());
        let body = &buf[pos + NLMSGHDR_LEN..pos + nlmsg_len];
        f(NlMessage { nlmsg_type: msg_type, body });
        pos += align4(nlmsg_len);
    }
}

/// Walks `nfgenmsg || nlattr*` bodies (the body of a `QUEUE`-subsystem
/// message), yielding `(attr_type, attr_body)` for each well-formed
/// attribute. Stops at the first attribute whose claimed length would read
/// past the buffer, rather than panicking.
pub fn for_each_attr<'a>(body: &'a [u8], mut f: impl FnMut(u16, &'a [u8])) {
    if body.len() < NFGENMSG_LEN {
        return;
    }
    let mut pos = NFGENMSG_LEN;
    while pos + NLA_HDR_LEN <= body.len() {
        let nla_len = u16::from_ne_bytes(body[pos..pos + 2].try_into().unwrap()) as usize;
        let nla_type = u16::from_ne_bytes(body[pos + 2..pos + 4].try_into().unwrap());
        if nla_len < NLA_HDR_LEN || pos + nla_len > body.len() {
            break;
        }
        let attr_body = &body[pos + NLA_HDR_LEN..pos + nla_len];
        f(nla_type & 0x7FFF, attr_body); // mask off NLA_F_NESTED/NLA_F_NET_BYTEORDER
        pos += align4(nla_len);
    }
}
