use base64::Engine;
use desync_proto::{
    build_fragments, extract_sni, BypassMethod, BypassSettings, Ipv4View, TcpView,
};
use serde::Deserialize;

const VECTORS_JSON: &str = include_str!("../../../protocol-vectors/desync-fragments.json");

#[derive(Debug, Deserialize)]
struct VectorFile {
    schema: u32,
    #[serde(rename = "fragmentScenarios")]
    fragment_scenarios: Vec<FragmentScenario>,
    #[serde(rename = "malformedSni")]
    malformed_sni: Vec<MalformedSni>,
}

#[derive(Debug, Deserialize)]
struct FragmentScenario {
    name: String,
    method: String,
    #[serde(rename = "firstSplitOffset")]
    first_split_offset: usize,
    #[serde(rename = "fragmentCount")]
    fragment_count: usize,
    #[serde(rename = "mixHostCase")]
    mix_host_case: bool,
    ip_b64: String,
    tcp_b64: String,
    payload_b64: String,
    #[serde(rename = "expectedPayloadLens")]
    expected_payload_lens: Option<Vec<usize>>,
}

#[derive(Debug, Deserialize)]
struct MalformedSni {
    name: String,
    payload_b64: String,
}

fn decode_b64(s: &str) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .expect("base64 decode")
}

fn method_from_str(s: &str) -> BypassMethod {
    match s {
        "SPLIT" => BypassMethod::Split,
        "SPLIT_REVERSE" => BypassMethod::SplitReverse,
        "DISORDER" => BypassMethod::Disorder,
        "DISORDER_REVERSE" => BypassMethod::DisorderReverse,
        other => panic!("unknown method {other}"),
    }
}

#[test]
fn desync_fragment_scenarios() {
    let vf: VectorFile = serde_json::from_str(VECTORS_JSON).expect("parse desync-fragments.json");
    assert_eq!(vf.schema, 1);

    for s in vf.fragment_scenarios {
        let ip_bytes = decode_b64(&s.ip_b64);
        let tcp_bytes = decode_b64(&s.tcp_b64);
        let payload = decode_b64(&s.payload_b64);

        let ip = Ipv4View::parse(&ip_bytes).unwrap_or_else(|e| panic!("{}: ip parse: {e}", s.name));
        let tcp = TcpView::parse(&tcp_bytes).unwrap_or_else(|e| panic!("{}: tcp parse: {e}", s.name));

        let settings = BypassSettings {
            method: method_from_str(&s.method),
            first_split_offset: s.first_split_offset,
            fragment_count: s.fragment_count,
            mix_host_case: s.mix_host_case,
            ..BypassSettings::default()
        };

        let frags = build_fragments(&ip, &tcp, &payload, &settings);

        if let Some(expected_lens) = &s.expected_payload_lens {
            let lens: Vec<usize> = frags.iter().map(|f| f.payload_len).collect();
            assert_eq!(&lens, expected_lens, "{}: payload lens", s.name);
        }

        // Every fragment is internally checksum-consistent.
        for f in &frags {
            let f_ip = Ipv4View::parse(&f.bytes).unwrap_or_else(|e| panic!("{}: {e}", s.name));
            assert_eq!(
                desync_proto::internet_checksum(f_ip.header_bytes()),
                0,
                "{}: ip checksum",
                s.name
            );
        }

        // Ascending-offset reassembly reproduces the (possibly case-mixed)
        // original payload byte-for-byte.
        let mut ordered = frags.clone();
        ordered.sort_by_key(|f| f.payload_offset);
        let mut reassembled = Vec::new();
        for f in &ordered {
            let f_ip = Ipv4View::parse(&f.bytes).unwrap();
            let f_tcp = TcpView::parse(&f.bytes[f_ip.header_len()..]).unwrap();
            assert_eq!(
                f_tcp.sequence() - tcp.sequence(),
                f.payload_offset as u32,
                "{}: seq offset",
                s.name
            );
            reassembled.extend_from_slice(f_tcp.payload());
        }
        if !s.mix_host_case {
            assert_eq!(reassembled, payload, "{}: reassembly", s.name);
        }

        // Pairwise-distinct IP IDs among siblings.
        let ids: std::collections::HashSet<u16> = frags
            .iter()
            .map(|f| Ipv4View::parse(&f.bytes).unwrap().identification())
            .collect();
        assert_eq!(ids.len(), frags.len(), "{}: distinct ip ids", s.name);
    }
}

#[test]
fn desync_malformed_sni_never_extracts_or_panics() {
    let vf: VectorFile = serde_json::from_str(VECTORS_JSON).expect("parse desync-fragments.json");
    for m in vf.malformed_sni {
        let payload = decode_b64(&m.payload_b64);
        assert_eq!(extract_sni(&payload), None, "{}", m.name);
    }
}
