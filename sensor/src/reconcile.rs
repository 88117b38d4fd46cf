//! Bulk read from the store into the flowgraph model.

use crate::packet::CLIENT_TAG;
use crate::store::{ExpiringStore, StoreResult};
use chrono::{DateTime, Utc};
use flowmap_flowgraph::{calc_prefix, Artifact, MappingGraph, OriginType, RenderedChain, DELIMITER};
use ipnet::IpNet;
use log::{debug, info, warn};
use serde::Serialize;
use std::net::IpAddr;

/// Known clients, ordered by address.
pub async fn list_clients(store: &dyn ExpiringStore) -> StoreResult<Vec<IpAddr>> {
    let prefix = format!("{CLIENT_TAG}{DELIMITER}");
    let mut clients: Vec<IpAddr> = store
        .keys(&prefix)
        .await?
        .into_iter()
        .filter_map(|key| match key[prefix.len()..].parse() {
            Ok(address) => Some(address),
            Err(_) => {
                warn!("reconcile.event=bad_client_key key={}", key);
                None
            }
        })
        .collect();
    clients.sort();
    clients.dedup();
    Ok(clients)
}

#[derive(Debug, Default)]
pub struct LoadedArtifacts {
    /// Decoded records plus the reversed copy of every recon record.
    pub artifacts: Vec<Artifact>,
    /// Stored records that decoded.
    pub records: usize,
    /// Records that failed to decode.
    pub skipped: usize,
}

/// Reads every record of every client inside `network` (all clients when
/// `None`). Recon records are also returned reversed so scans show up from
/// the scanned side. Records that fail to decode are logged and skipped.
///
/// DNS records outlive the client that made the request; they stay invisible
/// until that client shows up in the known-clients set again.
pub async fn load_client_artifacts(store: &dyn ExpiringStore, clients: &[IpAddr], network: Option<&IpNet>) -> StoreResult<LoadedArtifacts> {
    let mut loaded = LoadedArtifacts::default();
    for client in clients.iter().filter(|client| network.map_or(true, |net| net.contains(*client))) {
        let mut keys = store.keys(&format!("{client}{DELIMITER}")).await?;
        keys.sort();
        for key in keys {
            let Some(value) = store.get(&key).await? else {
                continue;
            };
            match Artifact::decode(&key, &value) {
                Ok(artifact) => {
                    loaded.records += 1;
                    if let Some(reversed) = artifact.reversed() {
                        loaded.artifacts.push(artifact);
                        loaded.artifacts.push(reversed);
                    } else {
                        loaded.artifacts.push(artifact);
                    }
                }
                Err(err) => {
                    loaded.skipped += 1;
                    warn!("reconcile.event=decode_failed key={} error={}", key, err);
                }
            }
        }
    }
    debug!(
        "reconcile.event=loaded clients={} records={} artifacts={} skipped={}",
        clients.len(),
        loaded.records,
        loaded.artifacts.len(),
        loaded.skipped
    );
    Ok(loaded)
}

/// What the reconcile tool prints.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub generated_at: DateTime<Utc>,
    pub origin: OriginType,
    pub prefix: Option<IpNet>,
    pub target: Option<IpNet>,
    /// Known clients inside the prefix.
    pub clients: Vec<IpAddr>,
    /// Stored records read.
    pub records: usize,
    /// Artifacts fed to the graph; recon records count twice.
    pub artifacts: usize,
    pub skipped: usize,
    pub chains: Vec<RenderedChain>,
}

/// Lists clients, loads their records and builds the chains for one projection.
///
/// Without an explicit `prefix` the longest prefix shared by every known
/// client is used. With a target the records of the whole prefix are still read unless
/// `target_only` is set, so names reached from outside the target show up
/// muted rather than missing.
pub async fn reconcile(
    store: &dyn ExpiringStore,
    origin: OriginType,
    prefix: Option<IpNet>,
    target: Option<IpNet>,
    target_only: bool,
) -> StoreResult<ReconcileReport> {
    let all_clients = list_clients(store).await?;
    let prefix = match prefix {
        Some(prefix) => Some(prefix),
        None => calc_prefix(None, &all_clients).ok().flatten(),
    };
    let clients: Vec<IpAddr> = all_clients.into_iter().filter(|client| prefix.map_or(true, |net| net.contains(client))).collect();

    let scope = if target_only { target.or(prefix) } else { prefix };
    let loaded = load_client_artifacts(store, &clients, scope.as_ref()).await?;
    let forest = MappingGraph::build(origin, target, &loaded.artifacts).chains();
    if forest.is_empty() {
        warn!("reconcile.event=empty origin={} clients={} records={}", origin.as_str(), clients.len(), loaded.records);
    }
    let chains = forest.render();
    info!(
        "reconcile.event=done origin={} clients={} records={} artifacts={} skipped={} nodes={} chains={}",
        origin.as_str(),
        clients.len(),
        loaded.records,
        loaded.artifacts.len(),
        loaded.skipped,
        forest.len(),
        chains.len()
    );

    Ok(ReconcileReport {
        generated_at: Utc::now(),
        origin,
        prefix,
        target,
        clients,
        records: loaded.records,
        artifacts: loaded.artifacts.len(),
        skipped: loaded.skipped,
        chains,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(60);

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.incr_expire("client;10.0.0.5", TTL).await.unwrap();
        store.incr_expire("client;10.0.1.9", TTL).await.unwrap();
        store.insert("client;not-an-address", "1", TTL);
        store.insert("10.0.0.5;93.184.216.34;dns", "www.example.com;", TTL);
        store.insert("10.0.0.5;93.184.216.34;443;flow", "3", TTL);
        store.insert("10.0.0.5;10.0.1.9;22;rst", "1", TTL);
        store.insert("10.0.0.5;garbage;flow", "1", TTL);
        store.insert("10.0.1.9;1.1.1.1;53;flow", "2", TTL);
        store
    }

    #[tokio::test]
    async fn lists_clients_in_address_order() {
        let store = seeded().await;
        let clients = list_clients(&store).await.unwrap();
        assert_eq!(clients, vec!["10.0.0.5".parse::<IpAddr>().unwrap(), "10.0.1.9".parse().unwrap()]);
    }

    #[tokio::test]
    async fn loads_scoped_records_and_reverses_recon() {
        let store = seeded().await;
        let clients = list_clients(&store).await.unwrap();
        let network: IpNet = "10.0.0.0/24".parse().unwrap();
        let loaded = load_client_artifacts(&store, &clients, Some(&network)).await.unwrap();

        assert_eq!(loaded.skipped, 1);
        assert_eq!(loaded.records, 3);
        assert_eq!(loaded.artifacts.len(), 4);
        assert!(loaded.artifacts.iter().all(|a| a.client_address() != "10.0.1.9".parse::<IpAddr>().unwrap() || a.kind().is_recon()));
        let reversed: Vec<_> = loaded.artifacts.iter().filter(|a| a.kind().is_recon()).map(|a| a.client_address().to_string()).collect();
        assert_eq!(reversed, vec!["10.0.0.5", "10.0.1.9"]);
    }

    #[tokio::test]
    async fn report_renders_address_chains() {
        let store = seeded().await;
        let report = reconcile(&store, OriginType::Address, None, None, false).await.unwrap();
        assert_eq!(report.clients.len(), 2);
        assert_eq!(report.prefix, Some("10.0.0.0/23".parse().unwrap()));
        assert_eq!(report.records, 4);
        assert_eq!(report.artifacts, 5);
        let names: Vec<_> = report.chains.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"93.184.216.34"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["origin"], "address");
        assert_eq!(json["records"], 4);
    }

    #[tokio::test]
    async fn empty_store_yields_empty_report() {
        let store = MemoryStore::new();
        let report = reconcile(&store, OriginType::Fqdn, None, None, false).await.unwrap();
        assert!(report.clients.is_empty());
        assert_eq!(report.prefix, None);
        assert_eq!(report.records, 0);
        assert!(report.chains.is_empty());
    }
}
