//! Media replication.
//!
//! Each side offers a catalog filtered for the remote device, asks for the
//! names it lacks from the remote's catalog and serves what it is asked for
//! in chunks of at most [`limits::MAX_BLOB_CHUNK`] bytes. A side says `Done`
//! once the remote has finished asking, everything requested of it has been
//! sent and everything it requested has arrived or been refused, so a
//! received `Done` means the remote holds every blob it wanted.

use std::collections::{BTreeSet, VecDeque};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use fieldsync_core::DeviceType;
use fieldsync_store::{validate_media_name, MediaStore};

use crate::channel::{Channel, Event};
use crate::error::{ProtocolError, Result, SyncError};
use crate::messages::{decode, encode, limits, MediaMessage};
use crate::progress::ProgressReporter;

/// Prefix of full-resolution originals.
pub const ORIGINALS_PREFIX: &str = "original/";

/// Whether `name` may be offered to a device of type `remote`.
pub fn offered_to(remote: DeviceType, name: &str) -> bool {
    !(remote.is_mobile() && name.starts_with(ORIGINALS_PREFIX))
}

/// Counters from one media replication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaStats {
    pub blobs_sent: u64,
    pub blobs_received: u64,
    /// Names requested of us that we could not or would not serve.
    pub skipped: u64,
    /// Names we requested that the remote refused.
    pub unavailable: u64,
}

impl MediaStats {
    fn settled(&self) -> u64 {
        self.blobs_sent + self.skipped + self.blobs_received + self.unavailable
    }
}

/// A blob being sent.
struct Outgoing {
    name: String,
    data: Bytes,
    offset: usize,
}

/// A blob being received.
struct Incoming {
    name: String,
    data: BytesMut,
}

struct MediaReplication<'a, M: ?Sized> {
    store: &'a M,
    progress: &'a ProgressReporter,
    stats: MediaStats,

    offered: BTreeSet<String>,
    outbox: VecDeque<MediaMessage>,
    serving: VecDeque<String>,
    outgoing: Option<Outgoing>,
    wanted: BTreeSet<String>,
    incoming: Option<Incoming>,

    catalog_done: bool,
    wants_done: bool,
    done_queued: bool,
    done_sent: bool,
    remote_done: bool,
}

/// Replicate media blobs with the peer on `channel`.
///
/// `remote` is the device type the peer declared in its handshake.
pub async fn replicate_media<M, C>(
    store: &M,
    channel: &mut C,
    remote: DeviceType,
    progress: &ProgressReporter,
) -> Result<MediaStats>
where
    M: MediaStore + ?Sized,
    C: Channel + ?Sized,
{
    let catalog: Vec<String> = store
        .list()
        .await?
        .into_iter()
        .filter(|name| offered_to(remote, name))
        .collect();
    debug!(offered = catalog.len(), %remote, "sending media catalog");

    let mut state = MediaReplication::new(store, progress, catalog);
    while !(state.done_sent && state.remote_done) {
        state.queue_done();
        let sending = state.has_outgoing();

        match channel.next_event(sending).await? {
            Event::Writable => state.send_next(channel).await?,
            Event::Received(raw) => {
                let raw = raw.ok_or(SyncError::ConnectionLost)?;
                let message: MediaMessage = decode(&raw)?;
                message.validate_limits()?;
                state.on_message(message).await?;
            }
        }
    }

    channel.close().await?;
    progress.update(|p| p.media.complete());

    let stats = state.stats;
    debug!(
        sent = stats.blobs_sent,
        received = stats.blobs_received,
        skipped = stats.skipped,
        unavailable = stats.unavailable,
        "media replication complete"
    );
    Ok(stats)
}

impl<'a, M: MediaStore + ?Sized> MediaReplication<'a, M> {
    fn new(store: &'a M, progress: &'a ProgressReporter, catalog: Vec<String>) -> Self {
        let mut outbox: VecDeque<MediaMessage> = catalog
            .chunks(limits::MAX_NAMES_PER_MESSAGE)
            .map(|chunk| MediaMessage::Catalog {
                names: chunk.to_vec(),
            })
            .collect();
        outbox.push_back(MediaMessage::EndOfCatalog);

        Self {
            store,
            progress,
            stats: MediaStats::default(),
            offered: catalog.into_iter().collect(),
            outbox,
            serving: VecDeque::new(),
            outgoing: None,
            wanted: BTreeSet::new(),
            incoming: None,
            catalog_done: false,
            wants_done: false,
            done_queued: false,
            done_sent: false,
            remote_done: false,
        }
    }

    fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty() || !self.serving.is_empty() || self.outgoing.is_some()
    }

    fn queue_done(&mut self) {
        let settled = self.catalog_done
            && self.wants_done
            && self.wanted.is_empty()
            && !self.has_outgoing();
        if settled && !self.done_queued {
            self.outbox.push_back(MediaMessage::Done);
            self.done_queued = true;
        }
    }

    fn publish(&self) {
        let settled = self.stats.settled();
        self.progress.update(|p| p.media.advance_to(settled));
    }

    async fn send_next<C: Channel + ?Sized>(&mut self, channel: &mut C) -> Result<()> {
        if let Some(message) = self.outbox.pop_front() {
            channel.send(encode(&message)?).await?;
            if message == MediaMessage::Done {
                self.done_sent = true;
            }
            return Ok(());
        }

        if self.outgoing.is_none() {
            let Some(name) = self.serving.pop_front() else {
                return Ok(());
            };
            match self.store.read(&name).await? {
                Some(data) => {
                    self.outgoing = Some(Outgoing {
                        name,
                        data,
                        offset: 0,
                    })
                }
                None => {
                    debug!(%name, "requested media vanished");
                    self.refuse(vec![name]);
                    return Ok(());
                }
            }
        }

        let Some(blob) = self.outgoing.as_mut() else {
            return Ok(());
        };
        let end = (blob.offset + limits::MAX_BLOB_CHUNK).min(blob.data.len());
        let last = end == blob.data.len();
        let chunk = MediaMessage::Chunk {
            name: blob.name.clone(),
            offset: blob.offset as u64,
            data: blob.data.slice(blob.offset..end),
            last,
        };
        blob.offset = end;
        channel.send(encode(&chunk)?).await?;

        if last {
            if let Some(blob) = self.outgoing.take() {
                trace!(name = %blob.name, bytes = blob.data.len(), "blob sent");
            }
            self.stats.blobs_sent += 1;
            self.publish();
        }
        Ok(())
    }

    /// Tell the remote we will not serve `names`.
    fn refuse(&mut self, names: Vec<String>) {
        if names.is_empty() {
            return;
        }
        self.stats.skipped += names.len() as u64;
        self.outbox.push_back(MediaMessage::Unavailable { names });
        self.publish();
    }

    async fn on_message(&mut self, message: MediaMessage) -> Result<()> {
        match message {
            MediaMessage::Catalog { names } => {
                if self.catalog_done {
                    return Err(ProtocolError::Unexpected("catalog after end of catalog".into()).into());
                }
                let mut want = Vec::new();
                for name in names {
                    if validate_media_name(&name).is_err() {
                        warn!(%name, "ignoring invalid media name");
                        continue;
                    }
                    if !self.store.exists(&name).await? && self.wanted.insert(name.clone()) {
                        want.push(name);
                    }
                }
                if !want.is_empty() {
                    let n = want.len() as u64;
                    self.outbox.push_back(MediaMessage::Want { names: want });
                    self.progress.update(|p| p.media.add_total(n));
                }
            }
            MediaMessage::EndOfCatalog => {
                if self.catalog_done {
                    return Err(ProtocolError::DuplicateMessage("end of catalog").into());
                }
                self.catalog_done = true;
                self.outbox.push_back(MediaMessage::EndOfWants);
            }
            MediaMessage::Want { names } => {
                if self.wants_done {
                    return Err(ProtocolError::Unexpected("want after end of wants".into()).into());
                }
                self.progress.update(|p| p.media.add_total(names.len() as u64));
                let (serve, refuse): (Vec<String>, Vec<String>) =
                    names.into_iter().partition(|name| self.offered.contains(name));
                if !refuse.is_empty() {
                    debug!(names = refuse.len(), "not serving requested media");
                }
                self.serving.extend(serve);
                self.refuse(refuse);
            }
            MediaMessage::EndOfWants => {
                if self.wants_done {
                    return Err(ProtocolError::DuplicateMessage("end of wants").into());
                }
                self.wants_done = true;
            }
            MediaMessage::Chunk {
                name,
                offset,
                data,
                last,
            } => self.on_chunk(name, offset, data, last).await?,
            MediaMessage::Unavailable { names } => {
                for name in names {
                    let partial = self.incoming.as_ref().is_some_and(|blob| blob.name == name);
                    if partial || !self.wanted.remove(&name) {
                        return Err(ProtocolError::Unexpected(format!("refusal of {name}")).into());
                    }
                    debug!(%name, "remote refused media");
                    self.stats.unavailable += 1;
                }
                self.publish();
            }
            MediaMessage::Done => {
                if !self.catalog_done {
                    return Err(ProtocolError::Unexpected("done before end of catalog".into()).into());
                }
                if self.remote_done {
                    return Err(ProtocolError::DuplicateMessage("done").into());
                }
                self.remote_done = true;
            }
        }
        Ok(())
    }

    async fn on_chunk(&mut self, name: String, offset: u64, data: Bytes, last: bool) -> Result<()> {
        if !self.wanted.contains(&name) {
            return Err(ProtocolError::Unexpected(format!("unrequested blob {name}")).into());
        }
        let mut blob = match self.incoming.take() {
            Some(blob) if blob.name == name => blob,
            Some(blob) => {
                return Err(ProtocolError::Unexpected(format!(
                    "blob {name} started before {} finished",
                    blob.name
                ))
                .into())
            }
            None => Incoming {
                name,
                data: BytesMut::new(),
            },
        };
        if offset != blob.data.len() as u64 {
            return Err(ProtocolError::Unexpected(format!(
                "chunk of {} at offset {offset}, expected {}",
                blob.name,
                blob.data.len()
            ))
            .into());
        }
        blob.data.extend_from_slice(&data);

        if !last {
            self.incoming = Some(blob);
            return Ok(());
        }
        self.wanted.remove(&blob.name);
        trace!(name = %blob.name, bytes = blob.data.len(), "blob received");
        self.store.write(&blob.name, blob.data.freeze()).await?;
        self.stats.blobs_received += 1;
        self.publish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::{pair, MemoryChannel};
    use crate::mux::Mux;
    use fieldsync_store::MemoryMediaStore;
    use std::sync::Arc;
    use std::time::Duration;

    async fn media(names: &[&str]) -> MemoryMediaStore {
        let store = MemoryMediaStore::new();
        for name in names {
            store
                .write(name, Bytes::from(format!("blob {name}")))
                .await
                .unwrap();
        }
        store
    }

    fn reporter() -> ProgressReporter {
        ProgressReporter::new(Duration::from_millis(200)).0
    }

    #[test]
    fn test_offered_to() {
        assert!(offered_to(DeviceType::Desktop, "original/a.jpg"));
        assert!(offered_to(DeviceType::Unknown, "original/a.jpg"));
        assert!(!offered_to(DeviceType::Mobile, "original/a.jpg"));
        assert!(offered_to(DeviceType::Mobile, "preview/a.jpg"));
        assert!(offered_to(DeviceType::Mobile, "thumbnail/a.jpg"));
    }

    #[tokio::test]
    async fn test_desktops_exchange_everything() {
        let a = media(&["original/a.jpg", "preview/a.jpg"]).await;
        let b = media(&["preview/b.jpg"]).await;

        let (mut ca, mut cb) = pair();
        let (pa, pb) = (reporter(), reporter());
        let (ra, rb) = tokio::join!(
            replicate_media(&a, &mut ca, DeviceType::Desktop, &pa),
            replicate_media(&b, &mut cb, DeviceType::Desktop, &pb),
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(ra.blobs_sent, 2);
        assert_eq!(ra.blobs_received, 1);
        assert_eq!(rb.blobs_received, 2);
        assert_eq!(a.list().await.unwrap(), b.list().await.unwrap());
        assert_eq!(
            b.read("original/a.jpg").await.unwrap().unwrap(),
            Bytes::from_static(b"blob original/a.jpg")
        );

        let pa = pa.finish();
        assert_eq!(pa.media.total, 3);
        assert_eq!(pa.media.sofar, 3);
    }

    #[tokio::test]
    async fn test_mobile_never_receives_originals() {
        let desktop = media(&["original/a.jpg", "preview/a.jpg", "thumbnail/a.jpg"]).await;
        let phone = MemoryMediaStore::new();

        let (mut cd, mut cp) = pair();
        let (pd, pp) = (reporter(), reporter());
        let (rd, rp) = tokio::join!(
            replicate_media(&desktop, &mut cd, DeviceType::Mobile, &pd),
            replicate_media(&phone, &mut cp, DeviceType::Desktop, &pp),
        );
        rd.unwrap();
        assert_eq!(rp.unwrap().blobs_received, 2);

        assert_eq!(
            phone.list().await.unwrap(),
            vec!["preview/a.jpg".to_string(), "thumbnail/a.jpg".to_string()]
        );
    }

    #[tokio::test]
    async fn test_existing_blobs_not_requested() {
        let a = media(&["preview/a.jpg"]).await;
        let b = media(&["preview/a.jpg"]).await;

        let (mut ca, mut cb) = pair();
        let (pa, pb) = (reporter(), reporter());
        let (ra, rb) = tokio::join!(
            replicate_media(&a, &mut ca, DeviceType::Desktop, &pa),
            replicate_media(&b, &mut cb, DeviceType::Desktop, &pb),
        );
        assert_eq!(ra.unwrap(), MediaStats::default());
        assert_eq!(rb.unwrap(), MediaStats::default());
        assert!(pa.finish().is_trivial());
    }

    fn wire(message: &MediaMessage) -> Bytes {
        encode(message).unwrap()
    }

    /// Read until `message` arrives, returning everything seen.
    async fn read_until(channel: &mut MemoryChannel, message: &MediaMessage) -> Vec<MediaMessage> {
        let mut seen = Vec::new();
        while !seen.contains(message) {
            let raw = channel.recv().await.unwrap().unwrap();
            seen.push(decode(&raw).unwrap());
        }
        seen
    }

    #[tokio::test]
    async fn test_unrequested_blob_rejected() {
        let store = MemoryMediaStore::new();
        let (mut ca, mut cb) = pair();

        let peer = async move {
            cb.send(wire(&MediaMessage::Chunk {
                name: "preview/x.jpg".into(),
                offset: 0,
                data: Bytes::from_static(b"x"),
                last: true,
            }))
            .await
            .unwrap();
            cb
        };
        let progress = reporter();
        let (result, _cb) = tokio::join!(
            replicate_media(&store, &mut ca, DeviceType::Desktop, &progress),
            peer,
        );
        assert!(matches!(
            result.unwrap_err(),
            SyncError::Protocol(ProtocolError::Unexpected(_))
        ));
        assert!(!store.exists("preview/x.jpg").await.unwrap());
    }

    #[tokio::test]
    async fn test_chunk_out_of_order_rejected() {
        let store = MemoryMediaStore::new();
        let (mut ca, mut cb) = pair();

        let peer = async move {
            cb.send(wire(&MediaMessage::Catalog {
                names: vec!["preview/x.jpg".into()],
            }))
            .await
            .unwrap();
            cb.send(wire(&MediaMessage::EndOfCatalog)).await.unwrap();
            read_until(&mut cb, &MediaMessage::EndOfWants).await;
            cb.send(wire(&MediaMessage::Chunk {
                name: "preview/x.jpg".into(),
                offset: 5,
                data: Bytes::from_static(b"tail"),
                last: true,
            }))
            .await
            .unwrap();
            cb
        };
        let progress = reporter();
        let (result, _cb) = tokio::join!(
            replicate_media(&store, &mut ca, DeviceType::Desktop, &progress),
            peer,
        );
        assert!(matches!(
            result.unwrap_err(),
            SyncError::Protocol(ProtocolError::Unexpected(_))
        ));
        assert!(!store.exists("preview/x.jpg").await.unwrap());
    }

    #[tokio::test]
    async fn test_refused_names_settle_the_session() {
        let store = MemoryMediaStore::new();
        let (mut ca, mut cb) = pair();

        let peer = async move {
            cb.send(wire(&MediaMessage::Catalog {
                names: vec!["preview/gone.jpg".into()],
            }))
            .await
            .unwrap();
            cb.send(wire(&MediaMessage::EndOfCatalog)).await.unwrap();
            cb.send(wire(&MediaMessage::EndOfWants)).await.unwrap();

            let seen = read_until(&mut cb, &MediaMessage::EndOfWants).await;
            assert!(seen.contains(&MediaMessage::Want {
                names: vec!["preview/gone.jpg".into()]
            }));
            cb.send(wire(&MediaMessage::Unavailable {
                names: vec!["preview/gone.jpg".into()],
            }))
            .await
            .unwrap();

            // Done only comes once the refusal has settled the want.
            read_until(&mut cb, &MediaMessage::Done).await;
            cb.send(wire(&MediaMessage::Done)).await.unwrap();
            cb
        };
        let progress = reporter();
        let (result, _cb) = tokio::join!(
            replicate_media(&store, &mut ca, DeviceType::Desktop, &progress),
            peer,
        );
        let stats = result.unwrap();
        assert_eq!(stats.unavailable, 1);
        assert_eq!(stats.blobs_received, 0);

        let last = progress.finish();
        assert_eq!((last.media.sofar, last.media.total), (1, 1));
    }

    #[tokio::test]
    async fn test_finishing_side_knows_remote_stored_everything() {
        let a = media(&["preview/1.jpg", "preview/2.jpg", "original/3.tif"]).await;
        let b = Arc::new(MemoryMediaStore::new());

        let (mut ca, mut cb) = pair();
        let remote = tokio::spawn({
            let b = b.clone();
            async move {
                let progress = reporter();
                replicate_media(&*b, &mut cb, DeviceType::Desktop, &progress).await
            }
        });

        let progress = reporter();
        let stats = replicate_media(&a, &mut ca, DeviceType::Desktop, &progress)
            .await
            .unwrap();
        assert_eq!(stats.blobs_sent, 3);
        // Checked before the remote task is awaited.
        assert_eq!(b.list().await.unwrap(), a.list().await.unwrap());

        assert_eq!(remote.await.unwrap().unwrap().blobs_received, 3);
    }

    #[tokio::test]
    async fn test_blob_larger_than_a_frame_over_mux() {
        let size = limits::MAX_FRAME_LENGTH + 3 * limits::MAX_BLOB_CHUNK / 2;
        let big = Bytes::from((0..size).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
        let a = MemoryMediaStore::new();
        a.write("original/big.tif", big.clone()).await.unwrap();
        let b = media(&["thumbnail/b.jpg"]).await;

        let (ta, tb) = tokio::io::duplex(64 * 1024);
        let (ma, mb) = (Mux::new(ta), Mux::new(tb));
        let mut sa = ma.open("media").unwrap();
        let mut sb = mb.open("media").unwrap();

        let (pa, pb) = (reporter(), reporter());
        let both = async {
            tokio::join!(
                replicate_media(&a, &mut sa, DeviceType::Desktop, &pa),
                replicate_media(&b, &mut sb, DeviceType::Desktop, &pb),
            )
        };
        let (ra, rb) = tokio::time::timeout(Duration::from_secs(120), both)
            .await
            .expect("media replication stalled");
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!((ra.blobs_sent, ra.blobs_received), (1, 1));
        assert_eq!((rb.blobs_sent, rb.blobs_received), (1, 1));
        let copy = b.read("original/big.tif").await.unwrap().unwrap();
        assert_eq!(copy.len(), size);
        assert!(copy == big);
    }
}
