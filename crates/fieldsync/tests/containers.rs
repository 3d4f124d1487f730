//! Engine replication through syncfiles and directories.

use std::sync::Arc;

use anyhow::Result;

use fieldsync::core::{DeviceType, Keypair, ProjectKey};
use fieldsync::discovery::memory::MemoryNetwork;
use fieldsync::store::{LogStore, MediaStore, MemoryLogStore, MemoryMediaStore, SqliteStore};
use fieldsync::syncfile::{detect, ContainerVersion, SyncfileConfig};
use fieldsync::{Engine, EngineConfig, SessionState};
use fieldsync_testkit::fixtures::blob;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config(device_type: DeviceType, default_format: ContainerVersion) -> EngineConfig {
    EngineConfig {
        device_type,
        syncfile: SyncfileConfig {
            default_format,
            ..SyncfileConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn memory_engine(seed: u8, config: EngineConfig) -> Engine<MemoryLogStore, MemoryMediaStore> {
    Engine::new(
        Keypair::from_seed(&[seed; 32]),
        ProjectKey::from_bytes([7; 32]),
        Arc::new(MemoryLogStore::new()),
        Arc::new(MemoryMediaStore::new()),
        Arc::new(MemoryNetwork::new().discovery()),
        config,
    )
}

#[tokio::test]
async fn test_file_carries_everything_between_devices() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("survey.sync");

    let a = memory_engine(1, config(DeviceType::Desktop, ContainerVersion::Legacy));
    for i in 0..10 {
        a.append("observations", format!("obs {i}")).await?;
    }
    a.media().write("preview/1.jpg", blob("preview/1.jpg")).await?;

    let handle = a.replicate_from_file(&path);
    let state = handle.state_updates();
    let summary = handle.wait().await?;
    assert_eq!(summary.logs.entries_sent, 10);
    assert_eq!(*state.borrow(), SessionState::Complete);
    assert_eq!(detect(&path).await?, Some(ContainerVersion::Legacy));

    // The second device opens it in whatever format it was written.
    let b = memory_engine(2, config(DeviceType::Mobile, ContainerVersion::Structured));
    let summary = b.replicate_from_file(&path).wait().await?;
    assert_eq!(summary.logs.entries_received, 10);
    assert_eq!(summary.media.blobs_received, 1);
    assert_eq!(a.logs().lengths().await?, b.logs().lengths().await?);

    // Replicating again changes nothing.
    let summary = b.replicate_from_file(&path).wait().await?;
    assert_eq!(summary.logs.entries_received, 0);
    assert_eq!(a.logs().lengths().await?, b.logs().lengths().await?);
    Ok(())
}

#[tokio::test]
async fn test_sqlite_device_through_directory() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Arc::new(SqliteStore::open(dir.path().join("device.db"))?);
    let a = Engine::new(
        Keypair::from_seed(&[3; 32]),
        ProjectKey::from_bytes([7; 32]),
        store.clone(),
        store,
        Arc::new(MemoryNetwork::new().discovery()),
        EngineConfig::default(),
    );
    a.append("tracks", "t0").await?;
    a.append("tracks", "t1").await?;
    a.media()
        .write("original/big.tif", blob("original/big.tif"))
        .await?;

    let usb = dir.path().join("usb");
    a.replicate_directory(&usb).wait().await?;

    let b = memory_engine(4, config(DeviceType::Desktop, ContainerVersion::Structured));
    let summary = b.replicate_directory(&usb).wait().await?;
    assert_eq!(summary.logs.entries_received, 2);
    assert!(b.media().exists("original/big.tif").await?);
    Ok(())
}
