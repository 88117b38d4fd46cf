use crate::artifact::{Artifact, ArtifactValue, Metadata, Orientation};
use crate::error::{MergeError, MergeResult};
use crate::kind::ArtifactKind;
use ipnet::IpNet;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

/// Merges same-variant artifacts, producing one artifact per distinct
/// identity (and orientation) in order of first appearance.
///
/// Onames are unioned and counts summed, so the result does not depend on
/// input order except for the representative client address: the first
/// member seeds it and every later member matching `target` overwrites it.
pub fn merge(artifacts: &[Artifact], target: Option<&IpNet>) -> MergeResult<Vec<Artifact>> {
    let first = artifacts.first().ok_or(MergeError::Empty)?;
    let expected = first.kind();
    if let Some(other) = artifacts.iter().find(|artifact| artifact.kind() != expected) {
        return Err(MergeError::MixedKinds { expected, found: other.kind() });
    }
    Ok(merge_homogeneous(artifacts.iter(), target))
}

/// Normalises one mapping list: groups by variant in order of first
/// appearance and merges each group.
pub fn merge_mappings(target: Option<&IpNet>, artifacts: &[Artifact]) -> Vec<Artifact> {
    let mut kinds: Vec<ArtifactKind> = Vec::new();
    for artifact in artifacts {
        if !kinds.contains(&artifact.kind()) {
            kinds.push(artifact.kind());
        }
    }
    kinds
        .into_iter()
        .flat_map(|kind| merge_homogeneous(artifacts.iter().filter(|artifact| artifact.kind() == kind), target))
        .collect()
}

fn merge_homogeneous<'a>(artifacts: impl Iterator<Item = &'a Artifact>, target: Option<&IpNet>) -> Vec<Artifact> {
    let mut order: Vec<(String, Orientation)> = Vec::new();
    let mut groups: HashMap<(String, Orientation), Accumulator> = HashMap::new();

    for artifact in artifacts {
        match groups.entry((artifact.identity(), artifact.orientation())) {
            Entry::Occupied(mut entry) => entry.get_mut().fold(artifact, target),
            Entry::Vacant(entry) => {
                order.push(entry.key().clone());
                entry.insert(Accumulator::seed(artifact));
            }
        }
    }

    order.into_iter().filter_map(|key| groups.remove(&key)).map(Accumulator::finish).collect()
}

struct Accumulator<'a> {
    seed: &'a Artifact,
    client_address: IpAddr,
    onames: BTreeSet<String>,
    count: i64,
    metadata: Metadata,
}

impl<'a> Accumulator<'a> {
    fn seed(artifact: &'a Artifact) -> Self {
        Self {
            seed: artifact,
            client_address: artifact.client_address(),
            onames: artifact.onames().iter().cloned().collect(),
            count: artifact.count().unwrap_or_default(),
            metadata: artifact.metadata(),
        }
    }

    fn fold(&mut self, artifact: &Artifact, target: Option<&IpNet>) {
        if artifact.is_targeted(target) {
            self.client_address = artifact.client_address();
        }
        self.onames.extend(artifact.onames().iter().cloned());
        if let Some(count) = artifact.count() {
            self.count = self.count.saturating_add(count);
        }
        for metadata_type in artifact.metadata_types() {
            self.metadata.entry(*metadata_type).or_default().extend(artifact.metadata_for(*metadata_type));
        }
    }

    fn finish(self) -> Artifact {
        let value = match self.seed.value() {
            ArtifactValue::Onames(_) => ArtifactValue::Onames(self.onames.into_iter().collect()),
            ArtifactValue::Count(_) => ArtifactValue::Count(self.count),
        };
        self.seed.with_merged(self.client_address, value, self.metadata)
    }
}
