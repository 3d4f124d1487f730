//! Live sync between engines on localhost.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;

use fieldsync::core::{DeviceType, Keypair, ProjectKey};
use fieldsync::discovery::memory::MemoryNetwork;
use fieldsync::store::{LogStore, MediaStore, MemoryLogStore, MemoryMediaStore};
use fieldsync::sync::messages::{decode, encode};
use fieldsync::sync::{
    Channel, ControlMessage, ErrorKind, HandshakePayload, Mux, Session, SessionTracker, SyncConfig,
};
use fieldsync::{
    Announcement, Discovery, Engine, EngineConfig, EngineError, ListenOptions, SessionState,
    SyncError, SyncOptions, TargetStatus, DEFAULT_SERVICE_TYPE,
};
use fieldsync_testkit::fixtures::blob;

type TestEngine = Engine<MemoryLogStore, MemoryMediaStore>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn project() -> ProjectKey {
    ProjectKey::from_bytes([42; 32])
}

fn localhost() -> ListenOptions {
    ListenOptions {
        addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        ..ListenOptions::default()
    }
}

fn engine(network: &Arc<MemoryNetwork>, seed: u8, device_type: DeviceType) -> TestEngine {
    Engine::new(
        Keypair::from_seed(&[seed; 32]),
        project(),
        Arc::new(MemoryLogStore::new()),
        Arc::new(MemoryMediaStore::new()),
        Arc::new(network.discovery()),
        EngineConfig {
            device_name: format!("device {seed}"),
            device_type,
            ..EngineConfig::default()
        },
    )
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

async fn put(engine: &TestEngine, name: &str) -> Result<()> {
    engine.media().write(name, blob(name)).await?;
    Ok(())
}

#[tokio::test]
async fn test_engines_discover_and_converge() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = engine(&network, 1, DeviceType::Desktop);
    let b = engine(&network, 2, DeviceType::Desktop);

    for i in 0..4 {
        a.append("observations", format!("a{i}")).await?;
    }
    b.append("observations", "b0").await?;
    b.append("tracks", "b1").await?;
    put(&a, "original/a.jpg").await?;
    put(&b, "preview/b.jpg").await?;

    a.listen(localhost()).await?;
    b.listen(localhost()).await?;

    let b_id = b.device_id().to_hex();
    eventually("target b", || a.target(&b_id).is_some()).await?;
    // Never our own announcement.
    assert_eq!(a.targets().len(), 1);
    assert_eq!(a.target(&b_id).map(|t| t.name), Some("device 2".to_string()));

    let handle = a.sync_to_target(&b_id, SyncOptions::default());
    let summary = handle.wait().await?;

    assert_eq!(summary.logs.entries_received, 2);
    assert_eq!(summary.logs.entries_sent, 4);
    assert_eq!(summary.media.blobs_received, 1);
    assert_eq!(summary.media.blobs_sent, 1);
    assert_eq!(summary.progress.db.sofar, summary.progress.db.total);
    assert_eq!(summary.remote.map(|r| r.id), Some(b.device_id()));

    assert_eq!(a.logs().lengths().await?, b.logs().lengths().await?);
    assert_eq!(a.media().list().await?, b.media().list().await?);

    eventually("target status", || {
        a.target(&b_id).map(|t| t.status) == Some(TargetStatus::ReplicationComplete)
    })
    .await?;

    a.close().await?;
    b.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_mobile_peer_never_receives_originals() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let desktop = engine(&network, 1, DeviceType::Desktop);
    let phone = engine(&network, 2, DeviceType::Mobile);

    for name in ["original/a.jpg", "preview/a.jpg", "thumbnail/a.jpg"] {
        put(&desktop, name).await?;
    }
    put(&phone, "original/p.jpg").await?;

    desktop.listen(localhost()).await?;
    phone.listen(localhost()).await?;

    let desktop_id = desktop.device_id().to_hex();
    eventually("desktop target", || phone.target(&desktop_id).is_some()).await?;
    assert_eq!(
        phone.target(&desktop_id).map(|t| t.device_type),
        Some(DeviceType::Desktop)
    );

    phone
        .sync_to_target(&desktop_id, SyncOptions::default())
        .wait()
        .await?;

    assert_eq!(
        phone.media().list().await?,
        vec![
            "original/p.jpg".to_string(),
            "preview/a.jpg".to_string(),
            "thumbnail/a.jpg".to_string()
        ]
    );
    // Desktops receive everything, originals included.
    assert!(desktop.media().exists("original/p.jpg").await?);

    phone.close().await?;
    desktop.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_target_is_peer_not_found() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = engine(&network, 1, DeviceType::Desktop);

    let handle = a.sync_to_target("feedface", SyncOptions::default());
    assert_eq!(handle.state(), SessionState::Error(ErrorKind::PeerNotFound));
    assert!(matches!(handle.wait().await, Err(SyncError::PeerNotFound(_))));
    Ok(())
}

#[tokio::test]
async fn test_close_withdraws_device() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = engine(&network, 1, DeviceType::Desktop);
    let b = engine(&network, 2, DeviceType::Desktop);

    let addr = a.listen(localhost()).await?;
    b.listen(localhost()).await?;
    let a_id = a.device_id().to_hex();
    eventually("target a", || b.target(&a_id).is_some()).await?;

    // Hidden, but still serving.
    a.unannounce().await?;
    eventually("a hidden", || b.target(&a_id).is_none()).await?;
    assert!(tokio::net::TcpStream::connect(addr).await.is_ok());

    a.announce().await?;
    eventually("a visible", || b.target(&a_id).is_some()).await?;

    a.close().await?;
    eventually("a gone", || b.target(&a_id).is_none()).await?;
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    assert!(matches!(a.announce().await, Err(EngineError::NotListening)));

    // Closing twice is fine.
    a.close().await?;
    b.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_listen_again_forgets_targets() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = engine(&network, 1, DeviceType::Desktop);
    let b = engine(&network, 2, DeviceType::Desktop);

    a.listen(localhost()).await?;
    b.listen(localhost()).await?;
    let b_id = b.device_id().to_hex();
    eventually("target b", || a.target(&b_id).is_some()).await?;

    let second = a.listen(localhost()).await?;
    // Browsing restarts and replays what is visible.
    eventually("target b again", || a.target(&b_id).is_some()).await?;
    let a_id = a.device_id().to_hex();
    eventually("new address", || {
        b.target(&a_id).map(|t| t.port) == Some(second.port())
    })
    .await?;

    a.close().await?;
    b.close().await?;
    Ok(())
}

/// A peer that replicates logs, then hangs up when media starts.
async fn flaky_peer(listener: tokio::net::TcpListener, keypair: Keypair) -> Result<()> {
    let logs = Arc::new(MemoryLogStore::new());
    let media = Arc::new(MemoryMediaStore::new());
    let payload = HandshakePayload::new(keypair.device_id(), DeviceType::Desktop, "flaky")
        .with_project(project().discovery_key());

    let (stream, _) = listener.accept().await?;
    let mux = Mux::new(stream);
    let config = SyncConfig::default();
    let (tracker, _, _) = SessionTracker::new(&config);
    let mut session = Session::new(logs, media, payload, config, tracker);

    let Some(mut handshake) = mux.accept().await else { bail!("no handshake") };
    session.handshake(&mut handshake).await?;

    let Some(mut rpc) = mux.accept().await else { bail!("no rpc") };
    let Some(raw) = rpc.recv().await? else { bail!("rpc closed") };
    if !matches!(decode::<ControlMessage>(&raw)?, ControlMessage::Arm) {
        bail!("expected arm");
    }
    rpc.send(encode(&ControlMessage::Armed)?).await?;

    let Some(mut db) = mux.accept().await else { bail!("no db") };
    session.sync_db(&mut db).await?;

    let Some(media_stream) = mux.accept().await else { bail!("no media") };
    drop(mux);
    drop(media_stream);
    Ok(())
}

#[tokio::test]
async fn test_connection_lost_during_media() -> Result<()> {
    init_tracing();
    let network = MemoryNetwork::new();

    // The engine initiates: its id must be the smaller one.
    let mut keys = [Keypair::from_seed(&[1; 32]), Keypair::from_seed(&[2; 32])];
    keys.sort_by_key(|k| k.device_id());
    let [local_key, remote_key] = keys;

    let a = Engine::new(
        local_key,
        project(),
        Arc::new(MemoryLogStore::new()),
        Arc::new(MemoryMediaStore::new()),
        Arc::new(network.discovery()),
        EngineConfig::default(),
    );
    for i in 0..3 {
        a.append("observations", Bytes::from(format!("entry {i}"))).await?;
    }
    put(&a, "preview/a.jpg").await?;
    a.listen(ListenOptions {
        announce: false,
        ..localhost()
    })
    .await?;

    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();
    let remote_id = remote_key.device_id().to_hex();
    let peer = tokio::spawn(flaky_peer(listener, remote_key));

    let announcer = network.discovery();
    announcer
        .announce(Announcement {
            name: remote_id.clone(),
            host: "127.0.0.1".into(),
            port,
            service_type: DEFAULT_SERVICE_TYPE.into(),
            device_name: "flaky".into(),
            device_type: DeviceType::Desktop,
        })
        .await?;
    eventually("flaky target", || a.target(&remote_id).is_some()).await?;

    let handle = a.sync_to_target(&remote_id, SyncOptions::default());
    let progress = handle.progress_updates();
    let state = handle.state_updates();
    let err = handle.wait().await.unwrap_err();
    peer.await??;

    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    assert_eq!(*state.borrow(), SessionState::Error(ErrorKind::ConnectionLost));
    let last = (*progress.borrow()).expect("progress was reported");
    assert_eq!(last.db.total, 3);
    assert_eq!(last.db.sofar, 3);

    eventually("target error", || {
        a.target(&remote_id).map(|t| t.status) == Some(TargetStatus::ReplicationError)
    })
    .await?;

    a.close().await?;
    Ok(())
}
