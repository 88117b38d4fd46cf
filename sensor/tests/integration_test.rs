//! Integration tests for the flowmap sensor
//!
//! These tests drive the capture loop and the reconcile path end to end
//! against the in-process store.

use async_trait::async_trait;
use flowmap_flowgraph::OriginType;
use flowmap_sensor::{
    config::AgentConfig,
    metrics::{CaptureMetrics, WriteOutcome},
    packet::{SkipReason, IPPROTO_TCP, IPPROTO_UDP},
    reconcile::reconcile,
    service::{CaptureService, StopReason},
    source::{PacketSource, ReplaySource},
    store::{ExpiringStore, MemoryStore},
};
use ipnet::IpNet;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

/// IPv4 header without options, followed by the port pair.
fn ipv4_frame(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, src_port: u16, dst_port: u16) -> Vec<u8> {
    let mut frame = vec![0u8; 24];
    frame[0] = 0x45;
    frame[9] = protocol;
    frame[12..16].copy_from_slice(&src.octets());
    frame[16..20].copy_from_slice(&dst.octets());
    frame[20..22].copy_from_slice(&src_port.to_be_bytes());
    frame[22..24].copy_from_slice(&dst_port.to_be_bytes());
    frame
}

fn local() -> IpNet {
    "10.0.0.0/24".parse().unwrap()
}

fn create_test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.store.address = "memory://".to_string();
    config.writer.workers = 2;
    config
}

fn session_frames() -> Vec<Vec<u8>> {
    let client = Ipv4Addr::new(10, 0, 0, 5);
    let server = Ipv4Addr::new(93, 184, 216, 34);
    vec![
        ipv4_frame(client, server, IPPROTO_TCP, 50000, 443),
        ipv4_frame(server, client, IPPROTO_TCP, 443, 50000),
        ipv4_frame(client, server, IPPROTO_TCP, 50000, 443),
        ipv4_frame(Ipv4Addr::new(10, 0, 0, 7), Ipv4Addr::new(1, 1, 1, 1), IPPROTO_UDP, 40000, 53),
        ipv4_frame(client, Ipv4Addr::new(10, 0, 0, 7), IPPROTO_TCP, 50001, 22),
        vec![0x45, 0x00],
    ]
}

#[tokio::test]
async fn test_capture_drains_writes_on_exhaustion() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(CaptureMetrics::new());
    let service = CaptureService::new(&create_test_config(), local(), store.clone(), metrics.clone());

    let mut source = ReplaySource::new(session_frames());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let summary = service.run(&mut source, shutdown_rx).await;

    assert_eq!(summary.reason, StopReason::Exhausted);
    assert_eq!(summary.metrics.frames, 6);
    assert_eq!(summary.metrics.flows, 2);
    assert_eq!(summary.metrics.suppressed, 2);
    assert_eq!(metrics.skips(SkipReason::Internal), 1);
    assert_eq!(metrics.skips(SkipReason::Truncated), 1);
    assert_eq!(metrics.writes(WriteOutcome::Completed), 2);
    assert_eq!(metrics.writes(WriteOutcome::Cancelled), 0);

    assert_eq!(store.get("10.0.0.5;93.184.216.34;443;flow").await.unwrap().as_deref(), Some("1"));
    assert_eq!(store.get("10.0.0.7;1.1.1.1;53;flow").await.unwrap().as_deref(), Some("1"));
    assert_eq!(store.get("client;10.0.0.5").await.unwrap().as_deref(), Some("1"));
}

/// Replays its frames, then fails the way a dead interface does.
struct FailingSource {
    frames: ReplaySource,
    error_kind: io::ErrorKind,
}

#[async_trait]
impl PacketSource for FailingSource {
    async fn next_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.frames.next_frame(buf).await? {
            Some(len) => Ok(Some(len)),
            None => Err(io::Error::new(self.error_kind, "interface went away")),
        }
    }

    fn describe(&self) -> String {
        "failing".to_string()
    }
}

#[tokio::test]
async fn test_capture_stops_on_read_error_and_drains() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(CaptureMetrics::new());
    let service = CaptureService::new(&create_test_config(), local(), store.clone(), metrics.clone());

    let mut source = FailingSource { frames: ReplaySource::new(session_frames()), error_kind: io::ErrorKind::ConnectionReset };
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let summary = tokio::time::timeout(Duration::from_secs(5), service.run(&mut source, shutdown_rx))
        .await
        .expect("a read error must stop the loop");

    assert_eq!(summary.reason, StopReason::ReadError);
    assert_eq!(summary.metrics.frames, 6);
    assert_eq!(summary.metrics.read_errors, 1);
    assert_eq!(metrics.writes(WriteOutcome::Completed), 2);
    assert_eq!(metrics.writes(WriteOutcome::Cancelled), 0);
    assert_eq!(store.get("10.0.0.7;1.1.1.1;53;flow").await.unwrap().as_deref(), Some("1"));
}

#[tokio::test]
async fn test_capture_stops_on_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let service = CaptureService::new(&create_test_config(), local(), store.clone(), Arc::new(CaptureMetrics::new()));

    let mut source = ReplaySource::new(session_frames()).hold_open();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stop = async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
    };
    let (summary, ()) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(service.run(&mut source, shutdown_rx), stop) })
        .await
        .expect("shutdown must stop the loop");

    assert_eq!(summary.reason, StopReason::Shutdown);
    assert_eq!(summary.metrics.frames, 6);
    assert_eq!(source.remaining(), 0);
}

#[tokio::test]
async fn test_shutdown_before_start_reads_nothing() {
    let service = CaptureService::new(&create_test_config(), local(), Arc::new(MemoryStore::new()), Arc::new(CaptureMetrics::new()));
    let mut source = ReplaySource::new(session_frames());
    let (_shutdown_tx, shutdown_rx) = watch::channel(true);
    let summary = service.run(&mut source, shutdown_rx).await;

    assert_eq!(summary.reason, StopReason::Shutdown);
    assert_eq!(summary.metrics.frames, 0);
    assert_eq!(source.remaining(), 6);
}

#[test]
fn test_config_file_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("flowmap.toml");
    let mut config = create_test_config();
    config.capture.ignore = vec!["10.0.0.1/32".parse().unwrap()];
    config.stats.interval_secs = 60;

    config.save_to_file(&path).unwrap();
    let loaded = AgentConfig::from_file(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_config_validation() {
    let mut config = create_test_config();
    assert!(config.validate().is_ok());

    config.capture.recency.buckets = 1;
    assert!(config.validate().is_err());

    let mut config = create_test_config();
    config.logging.level = "chatty".to_string();
    assert!(config.validate().is_err());
}

#[tokio::test]
async fn test_capture_then_reconcile() {
    let store = Arc::new(MemoryStore::new());
    let service = CaptureService::new(&create_test_config(), local(), store.clone(), Arc::new(CaptureMetrics::new()));
    let mut source = ReplaySource::new(session_frames());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    service.run(&mut source, shutdown_rx).await;

    // What a DNS agent would have written for the same client.
    let ttl = Duration::from_secs(900);
    store.insert("10.0.0.5;93.184.216.34;dns", "www.example.com;", ttl);
    store.insert("10.0.0.5;www.example.com;cname", "example.com;", ttl);
    store.insert("10.0.0.5;10.0.0.7;22;rst", "4", ttl);

    let report = reconcile(store.as_ref(), OriginType::Fqdn, Some(local()), None, false).await.unwrap();
    assert_eq!(report.clients.len(), 2);
    assert_eq!(report.skipped, 0);
    let chain = report.chains.iter().find(|chain| chain.name == "example.com").expect("cname origin");
    assert_eq!(chain.children.len(), 1);
    assert_eq!(chain.children[0].name, "www.example.com");

    let report = reconcile(store.as_ref(), OriginType::Address, Some(local()), Some("10.0.0.5/32".parse().unwrap()), true).await.unwrap();
    // The rst record is read forwards and reversed.
    assert_eq!(report.records, 4);
    assert_eq!(report.artifacts, 5);
    let names: Vec<_> = report.chains.iter().map(|chain| chain.name.as_str()).collect();
    assert!(names.contains(&"93.184.216.34"));
    assert!(report.chains.iter().any(|chain| chain.recon));
}
