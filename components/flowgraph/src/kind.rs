use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Field separator used in both keys and list values.
pub const DELIMITER: char = ';';

/// The closed set of record variants found in the store. The trailing field of
/// every key is one of the tags returned by [`ArtifactKind::tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ArtifactKind {
    Dns,
    Cname,
    Nxdomain,
    Netflow,
    Rst,
    Icmp,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 6] =
        [ArtifactKind::Dns, ArtifactKind::Cname, ArtifactKind::Nxdomain, ArtifactKind::Netflow, ArtifactKind::Rst, ArtifactKind::Icmp];

    pub fn tag(self) -> &'static str {
        self.descriptor().tag
    }

    /// Name reported under the `types` metadata.
    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    pub fn index(self) -> usize {
        match self {
            ArtifactKind::Dns => 0,
            ArtifactKind::Cname => 1,
            ArtifactKind::Nxdomain => 2,
            ArtifactKind::Netflow => 3,
            ArtifactKind::Rst => 4,
            ArtifactKind::Icmp => 5,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        DESCRIPTORS.iter().find(|d| d.tag == tag).map(|d| d.kind)
    }

    pub fn descriptor(self) -> &'static KindDescriptor {
        &DESCRIPTORS[self.index()]
    }

    pub fn value_class(self) -> ValueClass {
        self.descriptor().value
    }

    /// RST and ICMP records are read as evidence of probing and can be reversed.
    pub fn is_recon(self) -> bool {
        self.descriptor().reversed_metadata.is_some()
    }

    /// Number of `;` separated fields in a key of this kind, tag included.
    pub fn key_fields(self) -> usize {
        match self.descriptor().identity {
            IdentityField::Endpoint => 4,
            _ => 3,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the stored value of a record is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueClass {
    /// Decimal integer, summed on merge.
    Counter,
    /// Delimited set of onames, unioned on merge.
    List,
}

/// Which key field a record is identified by when merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityField {
    RemoteAddress,
    Rname,
    Oname,
    Endpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataType {
    Targets,
    Clients,
    Types,
    Ports,
}

impl MetadataType {
    pub const ALL: [MetadataType; 4] = [MetadataType::Targets, MetadataType::Clients, MetadataType::Types, MetadataType::Ports];

    pub fn as_str(self) -> &'static str {
        match self {
            MetadataType::Targets => "targets",
            MetadataType::Clients => "clients",
            MetadataType::Types => "types",
            MetadataType::Ports => "ports",
        }
    }
}

/// Projection selector for mapping graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginType {
    Address,
    Fqdn,
}

impl OriginType {
    pub fn as_str(self) -> &'static str {
        match self {
            OriginType::Address => "address",
            OriginType::Fqdn => "fqdn",
        }
    }
}

impl FromStr for OriginType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "address" => Ok(OriginType::Address),
            "fqdn" => Ok(OriginType::Fqdn),
            other => Err(format!("unknown origin type '{other}', expected 'address' or 'fqdn'")),
        }
    }
}

/// Per-variant behavior table entry.
#[derive(Debug)]
pub struct KindDescriptor {
    pub kind: ArtifactKind,
    pub tag: &'static str,
    pub name: &'static str,
    pub value: ValueClass,
    pub identity: IdentityField,
    pub metadata: &'static [MetadataType],
    /// Present only for variants that support reversal.
    pub reversed_metadata: Option<&'static [MetadataType]>,
    /// Projections under which targeted records of this kind start a chain.
    pub origin_for: &'static [OriginType],
    /// Projections under which records of this kind are walked through.
    pub mapping_for: &'static [OriginType],
}

impl KindDescriptor {
    pub fn is_origin_for(&self, origin: OriginType) -> bool {
        self.origin_for.contains(&origin)
    }

    pub fn is_mapping_for(&self, origin: OriginType) -> bool {
        self.mapping_for.contains(&origin)
    }
}

const NAME_METADATA: &[MetadataType] = &[MetadataType::Clients, MetadataType::Types];
const FLOW_METADATA: &[MetadataType] = &[MetadataType::Clients, MetadataType::Types, MetadataType::Ports];
const REVERSED_FLOW_METADATA: &[MetadataType] = &[MetadataType::Targets, MetadataType::Types, MetadataType::Ports];

const FQDN_ONLY: &[OriginType] = &[OriginType::Fqdn];
const ADDRESS_ONLY: &[OriginType] = &[OriginType::Address];
const BOTH: &[OriginType] = &[OriginType::Address, OriginType::Fqdn];
const NEITHER: &[OriginType] = &[];

static DESCRIPTORS: [KindDescriptor; 6] = [
    KindDescriptor {
        kind: ArtifactKind::Dns,
        tag: "dns",
        name: "DNS",
        value: ValueClass::List,
        identity: IdentityField::RemoteAddress,
        metadata: NAME_METADATA,
        reversed_metadata: None,
        origin_for: FQDN_ONLY,
        mapping_for: BOTH,
    },
    KindDescriptor {
        kind: ArtifactKind::Cname,
        tag: "cname",
        name: "CNAME",
        value: ValueClass::List,
        identity: IdentityField::Rname,
        metadata: NAME_METADATA,
        reversed_metadata: None,
        origin_for: FQDN_ONLY,
        mapping_for: BOTH,
    },
    KindDescriptor {
        kind: ArtifactKind::Nxdomain,
        tag: "nx",
        name: "NXDOMAIN",
        value: ValueClass::Counter,
        identity: IdentityField::Oname,
        metadata: NAME_METADATA,
        reversed_metadata: None,
        origin_for: FQDN_ONLY,
        mapping_for: FQDN_ONLY,
    },
    KindDescriptor {
        kind: ArtifactKind::Netflow,
        tag: "flow",
        name: "Netflow",
        value: ValueClass::Counter,
        identity: IdentityField::Endpoint,
        metadata: FLOW_METADATA,
        reversed_metadata: None,
        origin_for: ADDRESS_ONLY,
        mapping_for: NEITHER,
    },
    KindDescriptor {
        kind: ArtifactKind::Rst,
        tag: "rst",
        name: "RST",
        value: ValueClass::Counter,
        identity: IdentityField::Endpoint,
        metadata: FLOW_METADATA,
        reversed_metadata: Some(REVERSED_FLOW_METADATA),
        origin_for: ADDRESS_ONLY,
        mapping_for: NEITHER,
    },
    KindDescriptor {
        kind: ArtifactKind::Icmp,
        tag: "icmp",
        name: "ICMP",
        value: ValueClass::Counter,
        identity: IdentityField::Endpoint,
        metadata: FLOW_METADATA,
        reversed_metadata: Some(REVERSED_FLOW_METADATA),
        origin_for: ADDRESS_ONLY,
        mapping_for: NEITHER,
    },
];
