/// Shared data contracts: packet records, flag classification, connection
/// keys, flow lifecycle types, statistics records, and the ingestion trait.
use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, FlowscopeError>;

#[derive(Debug, thiserror::Error)]
pub enum FlowscopeError {
    #[error("ingest: {0}")]
    Ingest(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// TCP flags
// ---------------------------------------------------------------------------

pub const FIN: i64 = 0x01;
pub const SYN: i64 = 0x02;
pub const RST: i64 = 0x04;
pub const PSH: i64 = 0x08;
pub const ACK: i64 = 0x10;
pub const URG: i64 = 0x20;
pub const ECE: i64 = 0x40;
pub const CWR: i64 = 0x80;

const FLAG_NAMES: [(&str, i64); 8] = [
    ("FIN", FIN),
    ("SYN", SYN),
    ("RST", RST),
    ("PSH", PSH),
    ("ACK", ACK),
    ("URG", URG),
    ("ECE", ECE),
    ("CWR", CWR),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn from_bits(value: i64) -> Self {
        Self {
            fin: value & FIN != 0,
            syn: value & SYN != 0,
            rst: value & RST != 0,
            psh: value & PSH != 0,
            ack: value & ACK != 0,
            urg: value & URG != 0,
            ece: value & ECE != 0,
            cwr: value & CWR != 0,
        }
    }
}

/// Classifies a raw flag value into the label used by the flag histogram and
/// the per-packet `flag_type` column.
///
/// `None` (missing or non-numeric input) classifies as `INVALID`. Four common
/// combinations get dedicated labels when they match exactly; any other value
/// with recognized bits yields the set flag names sorted alphabetically and
/// joined with `+`. Zero is `NONE`; a non-zero value with no recognized bits
/// is `OTHER_<value>`.
pub fn classify_flags(raw: Option<i64>) -> String {
    let Some(value) = raw else {
        return "INVALID".to_string();
    };

    match value {
        v if v == (SYN | ACK) => return "SYN+ACK".to_string(),
        v if v == (FIN | ACK) => return "FIN+ACK".to_string(),
        v if v == (PSH | ACK) => return "PSH+ACK".to_string(),
        v if v == (RST | ACK) => return "RST+ACK".to_string(),
        _ => {}
    }

    let mut set: Vec<&str> = FLAG_NAMES
        .iter()
        .filter(|(_, bit)| value & bit != 0)
        .map(|(name, _)| *name)
        .collect();

    if !set.is_empty() {
        set.sort_unstable();
        return set.join("+");
    }

    if value == 0 {
        "NONE".to_string()
    } else {
        format!("OTHER_{value}")
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Protocol tag carried by each packet record. Serialized as the IANA number
/// where known, and as an empty string when the source column was absent or
/// unintelligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other(i64),
    #[default]
    Unknown,
}

impl Protocol {
    pub fn from_number(n: i64) -> Self {
        match n {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            1 => Protocol::Icmp,
            other => Protocol::Other(other),
        }
    }

    /// Parses a raw column value: numeric forms map by IANA number, symbolic
    /// names (any case) map directly, anything else is `Unknown`.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Protocol::Unknown;
        }
        if let Ok(n) = raw.parse::<i64>() {
            return Protocol::from_number(n);
        }
        if let Ok(f) = raw.parse::<f64>() {
            if f.is_finite() {
                return Protocol::from_number(f as i64);
            }
        }
        if raw.eq_ignore_ascii_case("tcp") {
            Protocol::Tcp
        } else if raw.eq_ignore_ascii_case("udp") {
            Protocol::Udp
        } else if raw.eq_ignore_ascii_case("icmp") {
            Protocol::Icmp
        } else {
            Protocol::Unknown
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Protocol::Tcp)
    }

    pub fn number(&self) -> Option<i64> {
        match self {
            Protocol::Tcp => Some(6),
            Protocol::Udp => Some(17),
            Protocol::Icmp => Some(1),
            Protocol::Other(n) => Some(*n),
            Protocol::Unknown => None,
        }
    }
}

impl Serialize for Protocol {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.number() {
            Some(n) => serializer.serialize_i64(n),
            None => serializer.serialize_str(""),
        }
    }
}

struct ProtocolVisitor;

impl Visitor<'_> for ProtocolVisitor {
    type Value = Protocol;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a protocol number or name")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Protocol, E> {
        Ok(Protocol::from_number(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Protocol, E> {
        Ok(Protocol::from_number(v as i64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Protocol, E> {
        Ok(Protocol::from_number(v as i64))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Protocol, E> {
        Ok(Protocol::parse(v))
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(ProtocolVisitor)
    }
}

// ---------------------------------------------------------------------------
// Packet record
// ---------------------------------------------------------------------------

/// One normalized packet. Timestamps are in the capture's native microsecond
/// clock; `flags` keeps the raw integer so out-of-range values still classify
/// as `OTHER_<n>`, with bit tests masking the low byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub timestamp: i64,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: i64,
    pub flag_type: String,
    pub seq_num: i64,
    pub ack_num: i64,
    pub length: i64,
    pub protocol: Protocol,
}

impl PacketRecord {
    pub fn tcp_flags(&self) -> TcpFlags {
        TcpFlags::from_bits(self.flags)
    }
}

// ---------------------------------------------------------------------------
// Connection key
// ---------------------------------------------------------------------------

/// Direction-independent connection identifier: the lexicographically smaller
/// of the two `"ip:port-ip:port"` orderings, so both directions of a
/// connection map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn from_endpoints(src_ip: &str, src_port: u16, dst_ip: &str, dst_port: u16) -> Self {
        let forward = format!("{src_ip}:{src_port}-{dst_ip}:{dst_port}");
        let reverse = format!("{dst_ip}:{dst_port}-{src_ip}:{src_port}");
        if forward <= reverse {
            Self(forward)
        } else {
            Self(reverse)
        }
    }

    pub fn for_packet(pkt: &PacketRecord) -> Self {
        Self::from_endpoints(&pkt.src_ip, pkt.src_port, &pkt.dst_ip, pkt.dst_port)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Flow lifecycle enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    New,
    Establishing,
    Established,
    DataTransfer,
    Closing,
    Closed,
    Aborted,
    Invalid,
    Ongoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseType {
    Graceful,
    Abortive,
    Invalid,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    InvalidSynack,
    InvalidAck,
    RstDuringHandshake,
    IncompleteNoSyn,
    IncompleteNoSynack,
    IncompleteNoAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseTag {
    Syn,
    SynAck,
    Ack,
    Data,
    Fin,
    Rst,
    AckClose,
    AckData,
}

impl PhaseTag {
    pub fn description(&self) -> &'static str {
        match self {
            PhaseTag::Syn => "Connection Request",
            PhaseTag::SynAck => "Connection Acceptance",
            PhaseTag::Ack => "Connection Established",
            PhaseTag::Data => "Data Transfer",
            PhaseTag::Fin => "Close Request",
            PhaseTag::Rst => "Connection Aborted",
            PhaseTag::AckClose => "Close Acknowledgment",
            PhaseTag::AckData => "Data Acknowledgment",
        }
    }
}

// ---------------------------------------------------------------------------
// Flow types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseEntry {
    pub packet: PacketRecord,
    pub phase: PhaseTag,
    pub description: String,
}

impl PhaseEntry {
    pub fn new(packet: PacketRecord, phase: PhaseTag) -> Self {
        Self {
            packet,
            phase,
            description: phase.description().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phases {
    pub establishment: Vec<PhaseEntry>,
    pub data_transfer: Vec<PhaseEntry>,
    pub closing: Vec<PhaseEntry>,
}

/// The reconstructed lifecycle of one connection. Immutable once assembled;
/// totals are computed over the full sorted packet buffer, so they remain
/// accurate even when evaluation stopped early on a handshake violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub key: ConnectionKey,
    pub initiator: Option<String>,
    pub responder: Option<String>,
    pub initiator_port: Option<u16>,
    pub responder_port: Option<u16>,
    pub state: FlowState,
    pub phases: Phases,
    pub establishment_complete: bool,
    pub data_transfer_started: bool,
    pub closing_started: bool,
    pub close_type: Option<CloseType>,
    pub start_time: i64,
    pub end_time: i64,
    pub total_packets: u64,
    pub total_bytes: i64,
    pub invalid_reason: Option<InvalidReason>,
    pub expected_seq_num: Option<i64>,
    pub expected_ack_num: Option<i64>,
    pub invalid_packet: Option<PacketRecord>,
    pub syn_packet: Option<PacketRecord>,
    pub syn_ack_packet: Option<PacketRecord>,
    pub packets: Vec<PacketRecord>,
    pub ongoing: bool,
    #[serde(rename = "completed_by_timeout")]
    pub completed_by_timeout: bool,
}

impl Flow {
    /// Index entry for this flow: the lifecycle headline plus the locator of
    /// the chunk file holding the full detail.
    pub fn summarize(&self, chunk_file: &str, chunk_index: usize) -> FlowSummary {
        FlowSummary {
            id: self.id.clone(),
            key: self.key.clone(),
            initiator: self.initiator.clone(),
            responder: self.responder.clone(),
            initiator_port: self.initiator_port,
            responder_port: self.responder_port,
            state: self.state,
            close_type: self.close_type,
            start_time: self.start_time,
            end_time: self.end_time,
            total_packets: self.total_packets,
            total_bytes: self.total_bytes,
            establishment_complete: self.establishment_complete,
            data_transfer_started: self.data_transfer_started,
            closing_started: self.closing_started,
            invalid_reason: self.invalid_reason,
            ongoing: self.ongoing,
            establishment_packets: self.phases.establishment.len(),
            data_transfer_packets: self.phases.data_transfer.len(),
            closing_packets: self.phases.closing.len(),
            chunk_file: chunk_file.to_string(),
            chunk_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSummary {
    pub id: String,
    pub key: ConnectionKey,
    pub initiator: Option<String>,
    pub responder: Option<String>,
    pub initiator_port: Option<u16>,
    pub responder_port: Option<u16>,
    pub state: FlowState,
    pub close_type: Option<CloseType>,
    pub start_time: i64,
    pub end_time: i64,
    pub total_packets: u64,
    pub total_bytes: i64,
    pub establishment_complete: bool,
    pub data_transfer_started: bool,
    pub closing_started: bool,
    pub invalid_reason: Option<InvalidReason>,
    pub ongoing: bool,
    #[serde(rename = "establishment_packets")]
    pub establishment_packets: usize,
    #[serde(rename = "data_transfer_packets")]
    pub data_transfer_packets: usize,
    #[serde(rename = "closing_packets")]
    pub closing_packets: usize,
    #[serde(rename = "chunk_file")]
    pub chunk_file: String,
    #[serde(rename = "chunk_index")]
    pub chunk_index: usize,
}

// ---------------------------------------------------------------------------
// Statistics types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpStats {
    pub sent_packets: u64,
    pub recv_packets: u64,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub first_ts: Option<i64>,
    pub last_ts: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPairStats {
    pub ip1: String,
    pub ip2: String,
    pub packet_count: u64,
    pub a_to_b_packets: u64,
    pub b_to_a_packets: u64,
    pub a_to_b_bytes: u64,
    pub b_to_a_bytes: u64,
    pub first_ts: i64,
    pub last_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBin {
    #[serde(rename = "bin")]
    pub index: usize,
    pub start: i64,
    pub end: i64,
    pub count: u64,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
    pub duration: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub packets: String,
    pub flows_index: String,
    pub flow_chunks: String,
    pub time_bins: String,
    pub ip_stats: String,
    pub flag_stats: String,
    pub unique_ips: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub format: String,
    pub created: String,
    pub source_file: String,
    pub total_packets: u64,
    pub tcp_packets: u64,
    pub unique_ips: usize,
    pub total_flows: u64,
    pub flows_per_chunk: usize,
    pub total_chunks: usize,
    pub time_range: TimeRange,
    pub structure: ArtifactPaths,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[allow(async_fn_in_trait)]
pub trait RecordSource {
    /// Returns the next batch of packet records, or `None` at end of input.
    async fn next_batch(&mut self) -> Result<Option<Vec<PacketRecord>>>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet(
        src: &str,
        dst: &str,
        src_port: u16,
        dst_port: u16,
        flags: i64,
        timestamp: i64,
    ) -> PacketRecord {
        PacketRecord {
            timestamp,
            src_ip: src.to_string(),
            dst_ip: dst.to_string(),
            src_port,
            dst_port,
            flags,
            flag_type: classify_flags(Some(flags)),
            seq_num: 0,
            ack_num: 0,
            length: 0,
            protocol: Protocol::Tcp,
        }
    }

    // -- Flag classification --

    #[test]
    fn classify_exact_combinations() {
        assert_eq!(classify_flags(Some(0x12)), "SYN+ACK");
        assert_eq!(classify_flags(Some(0x11)), "FIN+ACK");
        assert_eq!(classify_flags(Some(0x18)), "PSH+ACK");
        assert_eq!(classify_flags(Some(0x14)), "RST+ACK");
    }

    #[test]
    fn classify_single_flags() {
        assert_eq!(classify_flags(Some(0x02)), "SYN");
        assert_eq!(classify_flags(Some(0x01)), "FIN");
        assert_eq!(classify_flags(Some(0x04)), "RST");
        assert_eq!(classify_flags(Some(0x10)), "ACK");
    }

    #[test]
    fn classify_multi_flag_sorted_alphabetically() {
        // PSH+ACK+URG does not match a dedicated combination, so it falls
        // through to the sorted join
        assert_eq!(classify_flags(Some(0x38)), "ACK+PSH+URG");
        assert_eq!(classify_flags(Some(0x03)), "FIN+SYN");
        assert_eq!(classify_flags(Some(0xFF)), "ACK+CWR+ECE+FIN+PSH+RST+SYN+URG");
    }

    #[test]
    fn classify_none_and_other() {
        assert_eq!(classify_flags(Some(0)), "NONE");
        assert_eq!(classify_flags(Some(0x100)), "OTHER_256");
    }

    #[test]
    fn classify_missing_is_invalid() {
        assert_eq!(classify_flags(None), "INVALID");
    }

    // -- TcpFlags --

    #[test]
    fn flags_from_bits() {
        let f = TcpFlags::from_bits(0x12);
        assert!(f.syn && f.ack);
        assert!(!f.fin && !f.rst && !f.psh && !f.urg && !f.ece && !f.cwr);

        let all = TcpFlags::from_bits(0xFF);
        assert!(all.fin && all.syn && all.rst && all.psh);
        assert!(all.ack && all.urg && all.ece && all.cwr);
    }

    #[test]
    fn flags_ignore_high_bits() {
        // Only the low byte carries flag semantics
        let f = TcpFlags::from_bits(0x100);
        assert_eq!(f, TcpFlags::default());
    }

    // -- Protocol --

    #[test]
    fn protocol_parse_numeric_and_symbolic() {
        assert_eq!(Protocol::parse("6"), Protocol::Tcp);
        assert_eq!(Protocol::parse("17"), Protocol::Udp);
        assert_eq!(Protocol::parse("1"), Protocol::Icmp);
        assert_eq!(Protocol::parse("47"), Protocol::Other(47));
        assert_eq!(Protocol::parse("TCP"), Protocol::Tcp);
        assert_eq!(Protocol::parse("tcp"), Protocol::Tcp);
        assert_eq!(Protocol::parse(""), Protocol::Unknown);
        assert_eq!(Protocol::parse("bogus"), Protocol::Unknown);
        assert_eq!(Protocol::parse("6.0"), Protocol::Tcp);
    }

    #[test]
    fn protocol_serializes_as_number_or_empty() {
        assert_eq!(serde_json::to_string(&Protocol::Tcp).unwrap(), "6");
        assert_eq!(serde_json::to_string(&Protocol::Other(47)).unwrap(), "47");
        assert_eq!(serde_json::to_string(&Protocol::Unknown).unwrap(), "\"\"");
    }

    #[test]
    fn protocol_roundtrip() {
        for proto in [Protocol::Tcp, Protocol::Udp, Protocol::Icmp, Protocol::Other(89)] {
            let json = serde_json::to_string(&proto).unwrap();
            let back: Protocol = serde_json::from_str(&json).unwrap();
            assert_eq!(back, proto);
        }
    }

    // -- Connection key --

    #[test]
    fn connection_key_is_commutative() {
        let a = ConnectionKey::from_endpoints("10.0.0.1", 1000, "10.0.0.2", 80);
        let b = ConnectionKey::from_endpoints("10.0.0.2", 80, "10.0.0.1", 1000);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "10.0.0.1:1000-10.0.0.2:80");
    }

    #[test]
    fn connection_key_orders_lexicographically() {
        // "192..." sorts after "10...", so the key starts with the smaller
        let key = ConnectionKey::from_endpoints("192.168.0.1", 443, "10.0.0.9", 55000);
        assert_eq!(key.as_str(), "10.0.0.9:55000-192.168.0.1:443");
    }

    #[test]
    fn connection_key_distinguishes_ports() {
        let a = ConnectionKey::from_endpoints("10.0.0.1", 1000, "10.0.0.2", 80);
        let b = ConnectionKey::from_endpoints("10.0.0.1", 1001, "10.0.0.2", 80);
        assert_ne!(a, b);
    }

    #[test]
    fn connection_key_from_packet_matches_endpoints() {
        let pkt = sample_packet("10.0.0.2", "10.0.0.1", 80, 1000, ACK, 5);
        assert_eq!(
            ConnectionKey::for_packet(&pkt),
            ConnectionKey::from_endpoints("10.0.0.1", 1000, "10.0.0.2", 80)
        );
    }

    // -- Serde labels --

    #[test]
    fn flow_state_uses_snake_case_labels() {
        assert_eq!(
            serde_json::to_string(&FlowState::DataTransfer).unwrap(),
            "\"data_transfer\""
        );
        assert_eq!(serde_json::to_string(&FlowState::Ongoing).unwrap(), "\"ongoing\"");
        assert_eq!(
            serde_json::to_string(&InvalidReason::RstDuringHandshake).unwrap(),
            "\"rst_during_handshake\""
        );
        assert_eq!(serde_json::to_string(&CloseType::Graceful).unwrap(), "\"graceful\"");
        assert_eq!(serde_json::to_string(&PhaseTag::SynAck).unwrap(), "\"syn_ack\"");
    }

    #[test]
    fn phase_entry_carries_description() {
        let pkt = sample_packet("10.0.0.1", "10.0.0.2", 1000, 80, SYN, 0);
        let entry = PhaseEntry::new(pkt, PhaseTag::Syn);
        assert_eq!(entry.description, "Connection Request");
    }

    #[test]
    fn time_bin_serializes_index_as_bin() {
        let bin = TimeBin { index: 3, start: 0, end: 10, count: 7 };
        let json = serde_json::to_value(&bin).unwrap();
        assert_eq!(json["bin"], 3);
        assert_eq!(json["count"], 7);
    }
}
