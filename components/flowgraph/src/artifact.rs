use crate::error::{DecodeError, DecodeResult};
use crate::kind::{ArtifactKind, IdentityField, MetadataType, OriginType, ValueClass, DELIMITER};
use ipnet::IpNet;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;

/// Accumulated metadata of a merged artifact, one set per exposed type.
pub type Metadata = BTreeMap<MetadataType, BTreeSet<String>>;

/// Variant specific identity half of a record key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    /// DNS answers, keyed by the address the names resolved to.
    Remote(IpAddr),
    /// CNAME targets.
    Rname(String),
    /// Names that failed to resolve.
    Oname(String),
    /// Netflow family: the remote side of a flow.
    Endpoint { address: IpAddr, port: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactValue {
    Onames(Vec<String>),
    Count(i64),
}

/// Which side of a probe the artifact is presented from. Only recon variants
/// are ever `Reversed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Forward,
    Reversed,
}

impl Orientation {
    fn flipped(self) -> Self {
        match self {
            Orientation::Forward => Orientation::Reversed,
            Orientation::Reversed => Orientation::Forward,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataState {
    /// Straight from a single record, metadata is derived on demand.
    Raw,
    /// Produced by a merge, metadata is whatever was accumulated.
    Merged(Metadata),
}

/// One decoded store record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    kind: ArtifactKind,
    client_address: IpAddr,
    subject: Subject,
    value: ArtifactValue,
    orientation: Orientation,
    state: MetadataState,
}

impl Artifact {
    pub fn dns(client_address: IpAddr, remote_address: IpAddr, onames: Vec<String>) -> Self {
        Self::raw(ArtifactKind::Dns, client_address, Subject::Remote(remote_address), ArtifactValue::Onames(onames))
    }

    pub fn cname(client_address: IpAddr, rname: impl Into<String>, onames: Vec<String>) -> Self {
        Self::raw(ArtifactKind::Cname, client_address, Subject::Rname(rname.into()), ArtifactValue::Onames(onames))
    }

    pub fn nxdomain(client_address: IpAddr, oname: impl Into<String>, count: i64) -> Self {
        Self::raw(ArtifactKind::Nxdomain, client_address, Subject::Oname(oname.into()), ArtifactValue::Count(count))
    }

    /// Any Netflow family record; `None` if `kind` is not keyed by endpoint.
    pub fn flow(kind: ArtifactKind, client_address: IpAddr, remote_address: IpAddr, remote_port: impl Into<String>, count: i64) -> Option<Self> {
        if kind.descriptor().identity != IdentityField::Endpoint {
            return None;
        }
        Some(Self::endpoint(kind, client_address, remote_address, remote_port.into(), count))
    }

    pub fn netflow(client_address: IpAddr, remote_address: IpAddr, remote_port: impl Into<String>, count: i64) -> Self {
        Self::endpoint(ArtifactKind::Netflow, client_address, remote_address, remote_port.into(), count)
    }

    fn endpoint(kind: ArtifactKind, client_address: IpAddr, remote_address: IpAddr, port: String, count: i64) -> Self {
        Self::raw(kind, client_address, Subject::Endpoint { address: remote_address, port }, ArtifactValue::Count(count))
    }

    fn raw(kind: ArtifactKind, client_address: IpAddr, subject: Subject, value: ArtifactValue) -> Self {
        Self { kind, client_address, subject, value, orientation: Orientation::Forward, state: MetadataState::Raw }
    }

    /// Parses a `(key, value)` pair as written by the agents.
    pub fn decode(key: &str, value: &str) -> DecodeResult<Self> {
        let fields: Vec<&str> = key.split(DELIMITER).collect();
        let tag = fields.last().copied().unwrap_or_default();
        let kind = ArtifactKind::from_tag(tag).ok_or_else(|| DecodeError::UnknownType(tag.to_string()))?;
        let expected = kind.key_fields();
        if fields.len() != expected {
            return Err(DecodeError::FieldCount { key: key.to_string(), expected, found: fields.len() });
        }

        let client_address = parse_address(fields[0])?;
        let subject = match kind.descriptor().identity {
            IdentityField::RemoteAddress => Subject::Remote(parse_address(fields[1])?),
            IdentityField::Rname => Subject::Rname(non_empty(fields[1], "rname", key)?),
            IdentityField::Oname => Subject::Oname(non_empty(fields[1], "oname", key)?),
            IdentityField::Endpoint => {
                Subject::Endpoint { address: parse_address(fields[1])?, port: non_empty(fields[2], "remote port", key)? }
            }
        };
        let value = match kind.value_class() {
            ValueClass::List => {
                ArtifactValue::Onames(value.split(DELIMITER).filter(|name| !name.is_empty()).map(str::to_string).collect())
            }
            ValueClass::Counter => {
                ArtifactValue::Count(value.trim().parse().map_err(|_| DecodeError::BadCounter(value.to_string()))?)
            }
        };

        Ok(Self::raw(kind, client_address, subject, value))
    }

    /// Inverse of [`Artifact::decode`]. List values carry a trailing delimiter
    /// the way the DNS agent writes them.
    pub fn encode(&self) -> (String, String) {
        let mut fields = vec![self.client_address.to_string()];
        match &self.subject {
            Subject::Remote(address) => fields.push(address.to_string()),
            Subject::Rname(name) | Subject::Oname(name) => fields.push(name.clone()),
            Subject::Endpoint { address, port } => {
                fields.push(address.to_string());
                fields.push(port.clone());
            }
        }
        fields.push(self.kind.tag().to_string());
        let key = fields.join(&DELIMITER.to_string());

        let value = match &self.value {
            ArtifactValue::Onames(onames) => onames.iter().map(|name| format!("{name}{DELIMITER}")).collect(),
            ArtifactValue::Count(count) => count.to_string(),
        };
        (key, value)
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn client_address(&self) -> IpAddr {
        self.client_address
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn value(&self) -> &ArtifactValue {
        &self.value
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn is_merged(&self) -> bool {
        matches!(self.state, MetadataState::Merged(_))
    }

    pub fn remote_address(&self) -> Option<IpAddr> {
        match &self.subject {
            Subject::Remote(address) | Subject::Endpoint { address, .. } => Some(*address),
            _ => None,
        }
    }

    pub fn remote_port(&self) -> Option<&str> {
        match &self.subject {
            Subject::Endpoint { port, .. } => Some(port),
            _ => None,
        }
    }

    /// The rname of a CNAME or the oname of an NXDOMAIN.
    pub fn name(&self) -> Option<&str> {
        match &self.subject {
            Subject::Rname(name) | Subject::Oname(name) => Some(name),
            _ => None,
        }
    }

    /// Empty for counter variants.
    pub fn onames(&self) -> &[String] {
        match &self.value {
            ArtifactValue::Onames(onames) => onames,
            ArtifactValue::Count(_) => &[],
        }
    }

    pub fn count(&self) -> Option<i64> {
        match self.value {
            ArtifactValue::Count(count) => Some(count),
            ArtifactValue::Onames(_) => None,
        }
    }

    /// Merge identity. Netflow family records are identified by `address+port`.
    pub fn identity(&self) -> String {
        match &self.subject {
            Subject::Remote(address) => address.to_string(),
            Subject::Rname(name) | Subject::Oname(name) => name.clone(),
            Subject::Endpoint { address, port } => format!("{address}+{port}"),
        }
    }

    pub fn metadata_types(&self) -> &'static [MetadataType] {
        let descriptor = self.kind.descriptor();
        match self.orientation {
            Orientation::Forward => descriptor.metadata,
            Orientation::Reversed => descriptor.reversed_metadata.unwrap_or(descriptor.metadata),
        }
    }

    pub fn metadata_for(&self, metadata_type: MetadataType) -> BTreeSet<String> {
        match &self.state {
            MetadataState::Merged(metadata) => metadata.get(&metadata_type).cloned().unwrap_or_default(),
            MetadataState::Raw => {
                if !self.metadata_types().contains(&metadata_type) {
                    return BTreeSet::new();
                }
                self.derive_metadata(metadata_type).into_iter().collect()
            }
        }
    }

    /// All exposed metadata as a map, materialising it for raw artifacts.
    pub fn metadata(&self) -> Metadata {
        match &self.state {
            MetadataState::Merged(metadata) => metadata.clone(),
            MetadataState::Raw => self.metadata_types().iter().map(|t| (*t, self.metadata_for(*t))).collect(),
        }
    }

    fn derive_metadata(&self, metadata_type: MetadataType) -> Option<String> {
        match metadata_type {
            MetadataType::Targets | MetadataType::Clients => Some(self.client_address.to_string()),
            MetadataType::Types => Some(self.kind.name().to_string()),
            MetadataType::Ports => self.remote_port().map(str::to_string),
        }
    }

    /// True when there is no filter or the client address falls inside it.
    pub fn is_targeted(&self, target: Option<&IpNet>) -> bool {
        target.map_or(true, |network| network.contains(&self.client_address))
    }

    /// Names this artifact leads to when walking a chain in the given projection.
    pub fn children(&self, origin_type: OriginType, target: Option<&IpNet>) -> Vec<(String, bool)> {
        let targeted = self.is_targeted(target);
        match (&self.subject, origin_type) {
            (Subject::Remote(_) | Subject::Rname(_), OriginType::Address) => {
                self.onames().iter().map(|name| (name.clone(), targeted)).collect()
            }
            (Subject::Remote(address), OriginType::Fqdn) => vec![(address.to_string(), targeted)],
            (Subject::Rname(name), OriginType::Fqdn) | (Subject::Oname(name), OriginType::Fqdn) => vec![(name.clone(), targeted)],
            (Subject::Oname(_), OriginType::Address) | (Subject::Endpoint { .. }, _) => Vec::new(),
        }
    }

    /// Nodes this artifact starts a chain from, when it is targeted.
    pub fn origin_names(&self, origin_type: OriginType) -> Vec<String> {
        if !self.kind.descriptor().is_origin_for(origin_type) {
            return Vec::new();
        }
        match &self.subject {
            Subject::Remote(_) | Subject::Rname(_) => self.onames().to_vec(),
            Subject::Oname(name) => vec![name.clone()],
            Subject::Endpoint { address, .. } => vec![address.to_string()],
        }
    }

    /// Nodes under which this artifact is filed for chain expansion.
    pub fn mapping_names(&self, origin_type: OriginType) -> Vec<String> {
        if !self.kind.descriptor().is_mapping_for(origin_type) {
            return Vec::new();
        }
        match (&self.subject, origin_type) {
            (Subject::Remote(address), OriginType::Address) => vec![address.to_string()],
            (Subject::Rname(name), OriginType::Address) => vec![name.clone()],
            (Subject::Remote(_) | Subject::Rname(_), OriginType::Fqdn) => self.onames().to_vec(),
            (Subject::Oname(name), _) => vec![name.clone()],
            (Subject::Endpoint { .. }, _) => Vec::new(),
        }
    }

    /// The probe as seen from the probed side: client and remote swap and the
    /// metadata switches between `clients` and `targets`. Reversing twice gives
    /// back the original presentation. `None` for variants that are not recon.
    pub fn reversed(&self) -> Option<Self> {
        if !self.kind.is_recon() {
            return None;
        }
        let Subject::Endpoint { address, port } = &self.subject else {
            return None;
        };
        Some(Self {
            kind: self.kind,
            client_address: *address,
            subject: Subject::Endpoint { address: self.client_address, port: port.clone() },
            value: self.value.clone(),
            orientation: self.orientation.flipped(),
            state: MetadataState::Raw,
        })
    }

    pub(crate) fn with_merged(&self, client_address: IpAddr, value: ArtifactValue, metadata: Metadata) -> Self {
        Self {
            kind: self.kind,
            client_address,
            subject: self.subject.clone(),
            value,
            orientation: self.orientation,
            state: MetadataState::Merged(metadata),
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (key, value) = self.encode();
        write!(f, "{key} -> {value:?}")
    }
}

fn parse_address(field: &str) -> DecodeResult<IpAddr> {
    field.parse().map_err(|_| DecodeError::BadAddress(field.to_string()))
}

fn non_empty(field: &str, what: &'static str, key: &str) -> DecodeResult<String> {
    if field.is_empty() {
        return Err(DecodeError::EmptyField { field: what, key: key.to_string() });
    }
    Ok(field.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn decodes_dns_record() {
        let artifact = Artifact::decode("10.0.0.5;93.184.216.34;dns", "www.example.com;").unwrap();
        assert_eq!(artifact.kind(), ArtifactKind::Dns);
        assert_eq!(artifact.client_address(), addr("10.0.0.5"));
        assert_eq!(artifact.remote_address(), Some(addr("93.184.216.34")));
        assert_eq!(artifact.onames(), ["www.example.com".to_string()]);
        assert!(!artifact.is_merged());
    }

    #[test]
    fn decodes_flow_family_and_ipv6() {
        let artifact = Artifact::decode("fd00::5;2001:db8::1;443;rst", "7").unwrap();
        assert_eq!(artifact.kind(), ArtifactKind::Rst);
        assert_eq!(artifact.remote_port(), Some("443"));
        assert_eq!(artifact.count(), Some(7));
        assert_eq!(artifact.identity(), "2001:db8::1+443");
    }

    #[test]
    fn rejects_malformed_records() {
        assert_eq!(Artifact::decode("10.0.0.5;x;client", "1"), Err(DecodeError::UnknownType("client".into())));
        assert!(matches!(Artifact::decode("10.0.0.5;1.2.3.4;flow", "1"), Err(DecodeError::FieldCount { expected: 4, found: 3, .. })));
        assert_eq!(Artifact::decode("10.0.0.300;1.2.3.4;dns", "a;"), Err(DecodeError::BadAddress("10.0.0.300".into())));
        assert_eq!(Artifact::decode("10.0.0.5;bad.example;nx", "many"), Err(DecodeError::BadCounter("many".into())));
        assert!(matches!(Artifact::decode("10.0.0.5;;cname", "a;"), Err(DecodeError::EmptyField { field: "rname", .. })));
    }

    #[test]
    fn list_values_drop_empty_entries() {
        let artifact = Artifact::decode("10.0.0.5;edge.example.net;cname", ";a.example.com;;b.example.com;").unwrap();
        assert_eq!(artifact.onames(), ["a.example.com".to_string(), "b.example.com".to_string()]);
    }

    #[test]
    fn encode_matches_agent_format() {
        let artifact = Artifact::dns(addr("10.0.0.5"), addr("93.184.216.34"), vec!["a.example.com".into(), "b.example.com".into()]);
        let (key, value) = artifact.encode();
        assert_eq!(key, "10.0.0.5;93.184.216.34;dns");
        assert_eq!(value, "a.example.com;b.example.com;");
        assert_eq!(Artifact::decode(&key, &value).unwrap(), artifact);
    }

    #[test]
    fn raw_metadata_is_derived() {
        let artifact = Artifact::netflow(addr("10.0.0.5"), addr("8.8.8.8"), "53", 2);
        assert_eq!(artifact.metadata_for(MetadataType::Clients), BTreeSet::from(["10.0.0.5".to_string()]));
        assert_eq!(artifact.metadata_for(MetadataType::Types), BTreeSet::from(["Netflow".to_string()]));
        assert_eq!(artifact.metadata_for(MetadataType::Ports), BTreeSet::from(["53".to_string()]));
        assert!(artifact.metadata_for(MetadataType::Targets).is_empty());

        let dns = Artifact::dns(addr("10.0.0.5"), addr("8.8.8.8"), vec![]);
        assert!(dns.metadata_for(MetadataType::Ports).is_empty());
    }

    #[test]
    fn children_follow_projection() {
        let target: IpNet = "10.0.0.0/24".parse().unwrap();
        let dns = Artifact::dns(addr("10.0.1.5"), addr("93.184.216.34"), vec!["www.example.com".into()]);
        assert_eq!(dns.children(OriginType::Address, None), vec![("www.example.com".to_string(), true)]);
        assert_eq!(dns.children(OriginType::Fqdn, Some(&target)), vec![("93.184.216.34".to_string(), false)]);

        let nx = Artifact::nxdomain(addr("10.0.0.5"), "nope.example", 1);
        assert!(nx.children(OriginType::Address, None).is_empty());
        assert_eq!(nx.children(OriginType::Fqdn, None), vec![("nope.example".to_string(), true)]);

        let flow = Artifact::netflow(addr("10.0.0.5"), addr("8.8.8.8"), "53", 1);
        assert!(flow.children(OriginType::Address, None).is_empty());
        assert!(flow.children(OriginType::Fqdn, None).is_empty());
    }

    #[test]
    fn origins_and_mappings_per_projection() {
        let cname = Artifact::cname(addr("10.0.0.5"), "edge.example.net", vec!["www.example.com".into()]);
        assert!(cname.origin_names(OriginType::Address).is_empty());
        assert_eq!(cname.origin_names(OriginType::Fqdn), vec!["www.example.com".to_string()]);
        assert_eq!(cname.mapping_names(OriginType::Address), vec!["edge.example.net".to_string()]);
        assert_eq!(cname.mapping_names(OriginType::Fqdn), vec!["www.example.com".to_string()]);

        let nx = Artifact::nxdomain(addr("10.0.0.5"), "nope.example", 1);
        assert!(nx.mapping_names(OriginType::Address).is_empty());

        let flow = Artifact::netflow(addr("10.0.0.5"), addr("8.8.8.8"), "53", 1);
        assert_eq!(flow.origin_names(OriginType::Address), vec!["8.8.8.8".to_string()]);
        assert!(flow.mapping_names(OriginType::Address).is_empty());
    }

    #[test]
    fn reversal_swaps_sides_and_metadata() {
        let icmp = Artifact::flow(ArtifactKind::Icmp, addr("10.0.0.9"), addr("10.0.0.5"), "161", 4).unwrap();
        let reversed = icmp.reversed().unwrap();
        assert_eq!(reversed.client_address(), addr("10.0.0.5"));
        assert_eq!(reversed.remote_address(), Some(addr("10.0.0.9")));
        assert_eq!(reversed.orientation(), Orientation::Reversed);
        assert_eq!(reversed.metadata_types(), &[MetadataType::Targets, MetadataType::Types, MetadataType::Ports]);
        assert_eq!(reversed.metadata_for(MetadataType::Targets), BTreeSet::from(["10.0.0.5".to_string()]));
        assert!(reversed.metadata_for(MetadataType::Clients).is_empty());
        assert_eq!(icmp.orientation(), Orientation::Forward);

        assert!(Artifact::netflow(addr("10.0.0.9"), addr("1.1.1.1"), "80", 1).reversed().is_none());
    }

    #[test]
    fn flow_constructor_rejects_non_endpoint_kinds() {
        for kind in [ArtifactKind::Dns, ArtifactKind::Cname, ArtifactKind::Nxdomain] {
            assert!(Artifact::flow(kind, addr("10.0.0.5"), addr("8.8.8.8"), "53", 1).is_none());
        }
        let rst = Artifact::flow(ArtifactKind::Rst, addr("10.0.0.5"), addr("8.8.8.8"), "53", 1).unwrap();
        assert_eq!(rst.kind(), ArtifactKind::Rst);
        assert_eq!(rst.remote_address(), Some(addr("8.8.8.8")));
    }
}
