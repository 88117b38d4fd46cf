//! Network layer header parsing and flow keying.
//!
//! Frames arrive without a link layer header (the packet socket is opened in
//! datagram mode), so parsing starts at the IP version nibble.

use flowmap_flowgraph::{ArtifactKind, DELIMITER};
use ipnet::IpNet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const IPV6_FRAGMENT: u8 = 44;
const IPV6_AUTH: u8 = 51;
const IPV6_EXTENSIONS: [u8; 3] = [0, 43, 60];

/// Why a frame produced no flow key. Skips are counted, never logged per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    Truncated,
    Version,
    /// Only the first fragment carries ports.
    Fragment,
    /// Neither TCP nor UDP.
    Protocol,
    /// Neither endpoint is on the local network.
    Foreign,
    /// Both endpoints are on the local network.
    Internal,
    /// An endpoint is in a configured ignore network.
    Ignored,
}

impl SkipReason {
    pub const ALL: [SkipReason; 7] = [
        SkipReason::Truncated,
        SkipReason::Version,
        SkipReason::Fragment,
        SkipReason::Protocol,
        SkipReason::Foreign,
        SkipReason::Internal,
        SkipReason::Ignored,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Truncated => "truncated",
            SkipReason::Version => "version",
            SkipReason::Fragment => "fragment",
            SkipReason::Protocol => "protocol",
            SkipReason::Foreign => "foreign",
            SkipReason::Internal => "internal",
            SkipReason::Ignored => "ignored",
        }
    }

    pub fn index(self) -> usize {
        match self {
            SkipReason::Truncated => 0,
            SkipReason::Version => 1,
            SkipReason::Fragment => 2,
            SkipReason::Protocol => 3,
            SkipReason::Foreign => 4,
            SkipReason::Internal => 5,
            SkipReason::Ignored => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl PacketHeader {
    /// Parses the IP header and the port pair of a TCP or UDP payload.
    pub fn parse(frame: &[u8]) -> Result<Self, SkipReason> {
        let first = *frame.first().ok_or(SkipReason::Truncated)?;
        let (src, dst, protocol, transport) = match first >> 4 {
            4 => parse_ipv4(frame)?,
            6 => parse_ipv6(frame)?,
            _ => return Err(SkipReason::Version),
        };
        let ports = frame.get(transport..transport + 4).ok_or(SkipReason::Truncated)?;
        Ok(Self {
            src,
            dst,
            protocol,
            src_port: u16::from_be_bytes([ports[0], ports[1]]),
            dst_port: u16::from_be_bytes([ports[2], ports[3]]),
        })
    }
}

fn parse_ipv4(frame: &[u8]) -> Result<(IpAddr, IpAddr, u8, usize), SkipReason> {
    if frame.len() < IPV4_MIN_HEADER {
        return Err(SkipReason::Truncated);
    }
    let header_len = usize::from(frame[0] & 0x0f) * 4;
    if header_len < IPV4_MIN_HEADER {
        return Err(SkipReason::Truncated);
    }
    let fragment_offset = u16::from_be_bytes([frame[6], frame[7]]) & 0x1fff;
    if fragment_offset != 0 {
        return Err(SkipReason::Fragment);
    }
    let protocol = frame[9];
    if protocol != IPPROTO_TCP && protocol != IPPROTO_UDP {
        return Err(SkipReason::Protocol);
    }
    let src = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
    let dst = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);
    Ok((src.into(), dst.into(), protocol, header_len))
}

fn parse_ipv6(frame: &[u8]) -> Result<(IpAddr, IpAddr, u8, usize), SkipReason> {
    if frame.len() < IPV6_HEADER {
        return Err(SkipReason::Truncated);
    }
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&frame[8..24]);
    let src = Ipv6Addr::from(octets);
    octets.copy_from_slice(&frame[24..40]);
    let dst = Ipv6Addr::from(octets);

    let mut next = frame[6];
    let mut offset = IPV6_HEADER;
    loop {
        match next {
            IPPROTO_TCP | IPPROTO_UDP => break,
            IPV6_FRAGMENT => {
                let ext = frame.get(offset..offset + 8).ok_or(SkipReason::Truncated)?;
                if u16::from_be_bytes([ext[2], ext[3]]) >> 3 != 0 {
                    return Err(SkipReason::Fragment);
                }
                next = ext[0];
                offset += 8;
            }
            IPV6_AUTH => {
                let ext = frame.get(offset..offset + 2).ok_or(SkipReason::Truncated)?;
                next = ext[0];
                offset += (usize::from(ext[1]) + 2) * 4;
            }
            ext_type if IPV6_EXTENSIONS.contains(&ext_type) => {
                let ext = frame.get(offset..offset + 2).ok_or(SkipReason::Truncated)?;
                next = ext[0];
                offset += (usize::from(ext[1]) + 1) * 8;
            }
            _ => return Err(SkipReason::Protocol),
        }
    }
    Ok((src.into(), dst.into(), next, offset))
}

/// Identity of one observed flow, oriented so the client is the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub client: IpAddr,
    pub remote: IpAddr,
    pub remote_port: u16,
}

impl FlowKey {
    /// `client;remote;port;flow`
    pub fn key(&self) -> String {
        format!(
            "{client}{d}{remote}{d}{port}{d}{tag}",
            client = self.client,
            remote = self.remote,
            port = self.remote_port,
            tag = ArtifactKind::Netflow.tag(),
            d = DELIMITER
        )
    }

    /// Key of the known-clients record for the local side.
    pub fn client_key(&self) -> String {
        client_key(self.client)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}#{}", self.client, self.remote, self.remote_port)
    }
}

/// Prefix of every known-clients record.
pub const CLIENT_TAG: &str = "client";

pub fn client_key(client: IpAddr) -> String {
    format!("{CLIENT_TAG}{DELIMITER}{client}")
}

/// Decides, per frame, whether it describes traffic between the local network
/// and the outside and keys it if so.
#[derive(Debug, Clone)]
pub struct FlowClassifier {
    local: IpNet,
    ignore: Vec<IpNet>,
}

impl FlowClassifier {
    pub fn new(local: IpNet, ignore: Vec<IpNet>) -> Self {
        Self { local, ignore }
    }

    pub fn local_network(&self) -> &IpNet {
        &self.local
    }

    pub fn classify(&self, frame: &[u8]) -> Result<FlowKey, SkipReason> {
        let header = PacketHeader::parse(frame)?;
        self.classify_header(&header)
    }

    pub fn classify_header(&self, header: &PacketHeader) -> Result<FlowKey, SkipReason> {
        if header.protocol != IPPROTO_TCP && header.protocol != IPPROTO_UDP {
            return Err(SkipReason::Protocol);
        }
        if self.ignore.iter().any(|net| net.contains(&header.src) || net.contains(&header.dst)) {
            return Err(SkipReason::Ignored);
        }
        match (self.local.contains(&header.src), self.local.contains(&header.dst)) {
            (true, true) => Err(SkipReason::Internal),
            (false, false) => Err(SkipReason::Foreign),
            (true, false) => Ok(FlowKey { client: header.src, remote: header.dst, remote_port: header.dst_port }),
            (false, true) => Ok(FlowKey { client: header.dst, remote: header.src, remote_port: header.src_port }),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{ipv4_frame, ipv6_frame};
    use super::*;
    use flowmap_flowgraph::Artifact;

    fn classifier(local: &str) -> FlowClassifier {
        FlowClassifier::new(local.parse().unwrap(), Vec::new())
    }

    #[test]
    fn outbound_frame_keys_destination() {
        let frame = ipv4_frame(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(93, 184, 216, 34), IPPROTO_TCP, 51000, 443);
        let key = classifier("10.0.0.0/24").classify(&frame).unwrap();
        assert_eq!(key.client, IpAddr::from([10, 0, 0, 5]));
        assert_eq!(key.remote, IpAddr::from([93, 184, 216, 34]));
        assert_eq!(key.remote_port, 443);
        assert_eq!(key.key(), "10.0.0.5;93.184.216.34;443;flow");
        assert_eq!(key.client_key(), "client;10.0.0.5");
    }

    #[test]
    fn inbound_frame_keys_source() {
        let frame = ipv4_frame(Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(10, 0, 0, 5), IPPROTO_UDP, 53, 40000);
        let key = classifier("10.0.0.0/24").classify(&frame).unwrap();
        assert_eq!(key.key(), "10.0.0.5;8.8.8.8;53;flow");
    }

    #[test]
    fn same_side_frames_are_skipped() {
        let c = classifier("10.0.0.0/24");
        let internal = ipv4_frame(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 6), IPPROTO_TCP, 1, 2);
        let foreign = ipv4_frame(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8), IPPROTO_TCP, 1, 2);
        assert_eq!(c.classify(&internal), Err(SkipReason::Internal));
        assert_eq!(c.classify(&foreign), Err(SkipReason::Foreign));
    }

    #[test]
    fn other_protocols_and_fragments_are_skipped() {
        let c = classifier("10.0.0.0/24");
        let icmp = ipv4_frame(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(8, 8, 8, 8), 1, 0, 0);
        assert_eq!(c.classify(&icmp), Err(SkipReason::Protocol));

        let mut fragment = ipv4_frame(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(8, 8, 8, 8), IPPROTO_UDP, 1, 2);
        fragment[7] = 0x10;
        assert_eq!(c.classify(&fragment), Err(SkipReason::Fragment));

        assert_eq!(c.classify(&[]), Err(SkipReason::Truncated));
        assert_eq!(c.classify(&[0x45; 12]), Err(SkipReason::Truncated));
        assert_eq!(c.classify(&[0x20; 40]), Err(SkipReason::Version));
    }

    #[test]
    fn ignore_list_wins() {
        let c = FlowClassifier::new("10.0.0.0/24".parse().unwrap(), vec!["10.0.0.53/32".parse().unwrap()]);
        let frame = ipv4_frame(Ipv4Addr::new(10, 0, 0, 53), Ipv4Addr::new(8, 8, 8, 8), IPPROTO_UDP, 53, 53);
        assert_eq!(c.classify(&frame), Err(SkipReason::Ignored));
    }

    #[test]
    fn ipv6_walks_extension_headers() {
        let local: Ipv6Addr = "fd00::5".parse().unwrap();
        let remote: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let hop_by_hop = vec![IPV6_FRAGMENT, 0, 0, 0, 0, 0, 0, 0];
        let first_fragment = vec![IPPROTO_TCP, 0, 0, 0, 0, 0, 0, 1];
        let frame = ipv6_frame(remote, local, 0, &[hop_by_hop, first_fragment], 443, 52000);
        let key = classifier("fd00::/64").classify(&frame).unwrap();
        assert_eq!(key.key(), "fd00::5;2001:db8::1;443;flow");

        let later_fragment = vec![IPPROTO_TCP, 0, 0x05, 0x00, 0, 0, 0, 1];
        let frame = ipv6_frame(remote, local, IPV6_FRAGMENT, &[later_fragment], 443, 52000);
        assert_eq!(classifier("fd00::/64").classify(&frame), Err(SkipReason::Fragment));

        let icmpv6 = ipv6_frame(remote, local, 58, &[], 0, 0);
        assert_eq!(classifier("fd00::/64").classify(&icmpv6), Err(SkipReason::Protocol));
    }

    #[test]
    fn family_mismatch_is_foreign() {
        let frame = ipv4_frame(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(8, 8, 8, 8), IPPROTO_TCP, 1, 2);
        assert_eq!(classifier("fd00::/64").classify(&frame), Err(SkipReason::Foreign));
    }

    #[test]
    fn flow_key_decodes_as_netflow() {
        let key = FlowKey { client: "10.0.0.5".parse().unwrap(), remote: "2001:db8::1".parse().unwrap(), remote_port: 8080 };
        let artifact = Artifact::decode(&key.key(), "1").unwrap();
        assert_eq!(artifact.kind(), ArtifactKind::Netflow);
        assert_eq!(artifact.remote_port(), Some("8080"));
    }
}
