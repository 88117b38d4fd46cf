//! Artifact model and reconciliation for stored flow and DNS records.

pub mod artifact;
pub mod error;
pub mod graph;
pub mod kind;
pub mod merge;
pub mod prefix;

pub use artifact::{Artifact, ArtifactValue, Metadata, MetadataState, Orientation, Subject};
pub use error::{DecodeError, DecodeResult, MergeError, MergeResult, PrefixError};
pub use graph::{ChainForest, ChainNode, MappingGraph, NodeLabel, RenderedChain, TOO_DEEP};
pub use kind::{ArtifactKind, MetadataType, OriginType, DELIMITER};
pub use merge::{merge, merge_mappings};
pub use prefix::{calc_prefix, parse_network};
