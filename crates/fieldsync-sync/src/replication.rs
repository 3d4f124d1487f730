//! Log replication over a channel.
//!
//! Both ends run the same procedure: announce their log lengths, upload what
//! the other side is missing, ingest what arrives, and finish once each side
//! has acknowledged the other's `Done` with `Synced`. Logs that grow locally
//! after the heads exchange are announced with a fresh `Have` and uploaded in
//! the same session. Download progress is driven by the store's append
//! broadcast, so entries landing from any source count toward a log's
//! expectation.

use std::collections::VecDeque;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace, warn};

use fieldsync_core::{validate_entry, validate_link, Entry, LogKey, LogLengths, ValidationError};
use fieldsync_store::{InsertResult, LogStore};

use crate::channel::{Channel, Event};
use crate::error::{ProtocolError, Result, SyncError};
use crate::messages::{decode, encode, limits, LogMessage};
use crate::progress::{expected_transfer, DbProgress, ProgressReporter};
use crate::session::SyncConfig;

/// Counters from one log replication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    pub entries_sent: u64,
    pub entries_received: u64,
    /// Entries the remote sent that we already had.
    pub duplicates: u64,
    /// Conflicting entries recorded as fork evidence.
    pub forks: u64,
    /// Entries dropped because they failed validation.
    pub invalid: u64,
}

/// Entries `first..=last` of one log, still to be uploaded.
#[derive(Debug, Clone, Copy)]
struct Upload {
    key: LogKey,
    next: u64,
    last: u64,
}

/// Where one side of a log replication stands.
struct Replication<'a, L: ?Sized> {
    store: &'a L,
    config: &'a SyncConfig,
    progress: &'a ProgressReporter,
    db: DbProgress,
    stats: LogStats,

    /// Lengths we told the remote about.
    announced: LogLengths,
    /// Lengths the remote told us about.
    remote: LogLengths,
    outbox: VecDeque<LogMessage>,
    uploads: VecDeque<Upload>,

    heads_done: bool,
    done_queued: bool,
    done_sent: bool,
    remote_done: bool,
    synced_queued: bool,
    synced_sent: bool,
    remote_synced: bool,
}

/// Replicate every log in `store` with the peer on `channel`.
///
/// Returns once the remote has confirmed it stored everything we sent and
/// we have stored everything it sent. On success the `db` progress counter
/// is complete and the sending half of `channel` is closed.
pub async fn replicate_logs<L, C>(
    store: &L,
    channel: &mut C,
    config: &SyncConfig,
    progress: &ProgressReporter,
) -> Result<LogStats>
where
    L: LogStore + ?Sized,
    C: Channel + ?Sized,
{
    let mut appended = store.subscribe();
    let mut listening = true;

    let local = store.lengths().await?;
    let mut state = Replication::new(store, config, progress, local);

    while !state.finished() {
        state.queue_acknowledgements();
        let sending = state.has_outgoing();

        tokio::select! {
            event = channel.next_event(sending) => match event? {
                Event::Writable => state.send_next(channel).await?,
                Event::Received(raw) => {
                    let raw = raw.ok_or(SyncError::ConnectionLost)?;
                    let message: LogMessage = decode(&raw)?;
                    message.validate_limits()?;
                    state.on_message(message).await?;
                }
            },
            event = appended.recv(), if listening => match event {
                Ok(appended) => state.on_appended(&appended.log).await?,
                Err(RecvError::Lagged(_)) => {
                    let keys: Vec<LogKey> = store.lengths().await?.into_keys().collect();
                    for key in &keys {
                        state.on_appended(key).await?;
                    }
                }
                Err(RecvError::Closed) => listening = false,
            },
        }
    }

    // Entries ingested in the last round may not have been observed yet.
    let keys: Vec<LogKey> = state.remote.keys().copied().collect();
    for key in &keys {
        state.refresh(key).await?;
    }
    state.publish();

    channel.close().await?;
    progress.update(|p| p.db.complete());

    let stats = state.stats;
    debug!(
        sent = stats.entries_sent,
        received = stats.entries_received,
        duplicates = stats.duplicates,
        forks = stats.forks,
        "log replication complete"
    );
    Ok(stats)
}

impl<'a, L: LogStore + ?Sized> Replication<'a, L> {
    fn new(
        store: &'a L,
        config: &'a SyncConfig,
        progress: &'a ProgressReporter,
        local: LogLengths,
    ) -> Self {
        let heads: Vec<(LogKey, u64)> = local.iter().map(|(k, v)| (*k, *v)).collect();
        let mut outbox: VecDeque<LogMessage> = heads
            .chunks(limits::MAX_HEADS_PER_MESSAGE)
            .map(|chunk| LogMessage::Have {
                logs: chunk.to_vec(),
            })
            .collect();
        outbox.push_back(LogMessage::EndOfHeads);

        Self {
            store,
            config,
            progress,
            db: DbProgress::new(),
            stats: LogStats::default(),
            announced: local,
            remote: LogLengths::new(),
            outbox,
            uploads: VecDeque::new(),
            heads_done: false,
            done_queued: false,
            done_sent: false,
            remote_done: false,
            synced_queued: false,
            synced_sent: false,
            remote_synced: false,
        }
    }

    fn finished(&self) -> bool {
        self.synced_sent && self.remote_synced
    }

    fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty() || !self.uploads.is_empty()
    }

    /// `Done` follows the last upload; `Synced` follows the remote's `Done`.
    fn queue_acknowledgements(&mut self) {
        if self.heads_done && !self.done_queued && !self.has_outgoing() {
            self.outbox.push_back(LogMessage::Done);
            self.done_queued = true;
        }
        if self.remote_done && !self.synced_queued {
            self.outbox.push_back(LogMessage::Synced);
            self.synced_queued = true;
        }
    }

    async fn send_next<C: Channel + ?Sized>(&mut self, channel: &mut C) -> Result<()> {
        if let Some(message) = self.outbox.pop_front() {
            channel.send(encode(&message)?).await?;
            match message {
                LogMessage::Done => self.done_sent = true,
                LogMessage::Synced => self.synced_sent = true,
                _ => {}
            }
            return Ok(());
        }

        let Some(upload) = self.uploads.front_mut() else {
            return Ok(());
        };
        let batch = self
            .config
            .max_batch_size
            .clamp(1, limits::MAX_ENTRIES_PER_MESSAGE) as u64;
        let end = upload.next.saturating_add(batch - 1).min(upload.last);
        let (key, start) = (upload.key, upload.next);
        if end == upload.last {
            self.uploads.pop_front();
        } else {
            upload.next = end + 1;
        }

        let entries = self.store.get_range(&key, start, end).await?;
        let n = entries.len() as u64;
        channel.send(encode(&LogMessage::Entries { entries })?).await?;

        self.stats.entries_sent += n;
        self.db.uploaded(n);
        self.publish();
        Ok(())
    }

    async fn on_message(&mut self, message: LogMessage) -> Result<()> {
        match message {
            LogMessage::Have { logs } => {
                if self.remote_done {
                    return Err(ProtocolError::Unexpected("heads after done".into()).into());
                }
                for (key, len) in logs {
                    if len.checked_add(1).is_none() {
                        return Err(ProtocolError::Unexpected(format!("log length {len} out of range")).into());
                    }
                    if self.heads_done {
                        self.remote_grew(key, len).await?;
                    } else {
                        self.remote.insert(key, len);
                    }
                }
            }
            LogMessage::EndOfHeads => {
                if self.heads_done {
                    return Err(ProtocolError::DuplicateMessage("end of heads").into());
                }
                self.heads_done = true;
                self.heads_exchanged().await?;
            }
            LogMessage::Entries { entries } => {
                if !self.heads_done {
                    return Err(ProtocolError::Unexpected("entries before heads".into()).into());
                }
                if self.remote_done {
                    return Err(ProtocolError::Unexpected("entries after done".into()).into());
                }
                for entry in entries {
                    ingest(self.store, entry, self.config.validate_entries, &mut self.stats).await?;
                }
            }
            LogMessage::Done => {
                if !self.heads_done {
                    return Err(ProtocolError::Unexpected("done before heads".into()).into());
                }
                if self.remote_done {
                    return Err(ProtocolError::DuplicateMessage("done").into());
                }
                self.remote_done = true;
            }
            LogMessage::Synced => {
                if !self.done_sent {
                    return Err(ProtocolError::Unexpected("synced before done".into()).into());
                }
                if self.remote_synced {
                    return Err(ProtocolError::DuplicateMessage("synced").into());
                }
                self.remote_synced = true;
            }
        }
        Ok(())
    }

    /// Work out both directions once the remote's heads are complete.
    async fn heads_exchanged(&mut self) -> Result<()> {
        let expected = expected_transfer(&self.announced, &self.remote);
        debug!(
            download = expected.download,
            upload = expected.upload,
            "log heads exchanged"
        );
        for (key, &n) in &expected.per_log_download {
            let remote_len = self.remote.get(key).copied().unwrap_or(0);
            let baseline = self.store.downloaded_count(key, 0, remote_len).await?;
            self.db.expect_log(*key, remote_len, baseline, n);
        }
        self.db.expect_upload(expected.upload);

        for (key, &local_len) in &self.announced {
            let remote_len = self.remote.get(key).copied().unwrap_or(0);
            if local_len > remote_len {
                self.uploads.push_back(Upload {
                    key: *key,
                    next: remote_len + 1,
                    last: local_len,
                });
            }
        }
        self.publish();

        // Logs that grew while the heads were in flight.
        let keys: Vec<LogKey> = self.store.lengths().await?.into_keys().collect();
        for key in &keys {
            self.local_grew(key).await?;
        }
        Ok(())
    }

    /// The remote announced a longer log after the heads exchange.
    async fn remote_grew(&mut self, key: LogKey, len: u64) -> Result<()> {
        let known = self.remote.get(&key).copied().unwrap_or(0);
        if len <= known {
            return Ok(());
        }
        self.remote.insert(key, len);

        match self.db.remote_len(&key) {
            Some(_) => self.db.extend_log(&key, len),
            None => {
                let local_len = self.store.length(&key).await?;
                if len > local_len {
                    let baseline = self.store.downloaded_count(&key, 0, len).await?;
                    self.db.expect_log(key, len, baseline, len - local_len);
                }
            }
        }
        trace!(log = %key, len, "remote log grew");
        self.refresh(&key).await?;
        self.publish();
        Ok(())
    }

    async fn on_appended(&mut self, key: &LogKey) -> Result<()> {
        self.local_grew(key).await?;
        self.refresh(key).await?;
        self.publish();
        Ok(())
    }

    /// Announce and queue entries appended locally that the remote lacks.
    async fn local_grew(&mut self, key: &LogKey) -> Result<()> {
        if !self.heads_done || self.done_queued {
            return Ok(());
        }
        let len = self.store.length(key).await?;
        let announced = self.announced.get(key).copied().unwrap_or(0);
        let remote = self.remote.get(key).copied().unwrap_or(0);
        let sent_up_to = announced.max(remote);
        if len <= sent_up_to {
            return Ok(());
        }
        let next = sent_up_to
            .checked_add(1)
            .ok_or_else(|| ProtocolError::Unexpected(format!("log length {sent_up_to} out of range")))?;

        trace!(log = %key, len, "announcing local growth");
        self.announced.insert(*key, len);
        self.outbox.push_back(LogMessage::Have {
            logs: vec![(*key, len)],
        });
        self.uploads.push_back(Upload {
            key: *key,
            next,
            last: len,
        });
        self.db.expect_upload(len - sent_up_to);
        Ok(())
    }

    async fn refresh(&mut self, key: &LogKey) -> Result<()> {
        if let Some(remote_len) = self.db.remote_len(key) {
            let count = self.store.downloaded_count(key, 0, remote_len).await?;
            self.db.observe(key, count);
        }
        Ok(())
    }

    fn publish(&self) {
        let (total, sofar) = (self.db.total(), self.db.sofar());
        self.progress.update(|p| {
            p.db.raise_total(total);
            p.db.advance_to(sofar);
        });
    }
}

/// Validate and store one incoming entry.
async fn ingest<L: LogStore + ?Sized>(
    store: &L,
    entry: Entry,
    validate: bool,
    stats: &mut LogStats,
) -> Result<()> {
    if validate {
        if let Err(e) = check(store, &entry).await? {
            warn!(log = %entry.log(), seq = entry.seq(), error = %e, "dropping invalid entry");
            stats.invalid += 1;
            return Ok(());
        }
    }

    match store.insert_entry(&entry).await? {
        InsertResult::Inserted => stats.entries_received += 1,
        InsertResult::AlreadyExists => stats.duplicates += 1,
        InsertResult::Conflict { existing } => {
            let incoming = entry.compute_id();
            warn!(
                log = %entry.log(),
                seq = entry.seq(),
                %existing,
                %incoming,
                "fork detected"
            );
            store.record_fork(entry.log(), entry.seq(), &incoming).await?;
            stats.forks += 1;
        }
    }
    Ok(())
}

/// Outer error: store failure. Inner error: the entry is invalid.
async fn check<L: LogStore + ?Sized>(
    store: &L,
    entry: &Entry,
) -> Result<std::result::Result<(), ValidationError>> {
    if let Err(e) = validate_entry(entry) {
        return Ok(Err(e));
    }
    if entry.seq() > 1 {
        if let Some(prev) = store.get_entry(entry.log(), entry.seq() - 1).await? {
            return Ok(validate_link(&prev, entry));
        }
    }
    Ok(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::{pair, pair_with_window};
    use fieldsync_core::{EntryBuilder, Keypair};
    use fieldsync_store::MemoryLogStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn chain(keypair: &Keypair, name: &str, n: u64) -> Vec<Entry> {
        let author = keypair.device_id();
        let log = LogKey::derive(&author, name);
        let mut out: Vec<Entry> = Vec::new();
        for seq in 1..=n {
            let mut builder = EntryBuilder::new(author, log, seq).payload(format!("{name} {seq}"));
            if let Some(last) = out.last() {
                builder = builder.prev(last.compute_id());
            }
            out.push(builder.sign(keypair));
        }
        out
    }

    async fn store_with(entries: &[Entry]) -> MemoryLogStore {
        let store = MemoryLogStore::new();
        for e in entries {
            store.insert_entry(e).await.unwrap();
        }
        store
    }

    fn reporter() -> ProgressReporter {
        ProgressReporter::new(Duration::from_millis(200)).0
    }

    #[tokio::test]
    async fn test_both_sides_converge() {
        let ka = Keypair::generate();
        let kb = Keypair::generate();
        let xs = chain(&ka, "x", 5);
        let ys = chain(&kb, "y", 3);

        let a = store_with(&xs).await;
        let b = store_with(&xs[..2]).await;
        for y in &ys {
            b.insert_entry(y).await.unwrap();
        }

        let (mut ca, mut cb) = pair();
        let config = SyncConfig::default();
        let (pa, pb) = (reporter(), reporter());
        let (ra, rb) = tokio::join!(
            replicate_logs(&a, &mut ca, &config, &pa),
            replicate_logs(&b, &mut cb, &config, &pb),
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(ra.entries_sent, 3);
        assert_eq!(ra.entries_received, 3);
        assert_eq!(rb.entries_sent, 3);
        assert_eq!(rb.entries_received, 3);
        assert_eq!(a.lengths().await.unwrap(), b.lengths().await.unwrap());

        let pa = pa.finish();
        assert_eq!(pa.db.total, 6);
        assert_eq!(pa.db.sofar, 6);
    }

    #[tokio::test]
    async fn test_small_batches() {
        let ka = Keypair::generate();
        let xs = chain(&ka, "x", 23);
        let a = store_with(&xs).await;
        let b = MemoryLogStore::new();

        let (mut ca, mut cb) = pair();
        let config = SyncConfig {
            max_batch_size: 4,
            ..SyncConfig::default()
        };
        let (pa, pb) = (reporter(), reporter());
        let (ra, rb) = tokio::join!(
            replicate_logs(&a, &mut ca, &config, &pa),
            replicate_logs(&b, &mut cb, &config, &pb),
        );
        assert_eq!(ra.unwrap().entries_sent, 23);
        assert_eq!(rb.unwrap().entries_received, 23);
        assert_eq!(b.length(xs[0].log()).await.unwrap(), 23);
    }

    #[tokio::test]
    async fn test_unlinked_entry_dropped() {
        let keypair = Keypair::generate();
        let author = keypair.device_id();
        let log = LogKey::derive(&author, "obs");
        let mine = EntryBuilder::new(author, log, 1).payload("mine").sign(&keypair);
        let theirs = EntryBuilder::new(author, log, 1).payload("theirs").sign(&keypair);
        let next = EntryBuilder::new(author, log, 2)
            .prev(theirs.compute_id())
            .payload("next")
            .sign(&keypair);

        let a = store_with(&[mine.clone()]).await;
        let b = store_with(&[theirs, next]).await;

        let (mut ca, mut cb) = pair();
        let config = SyncConfig::default();
        let (pa, pb) = (reporter(), reporter());
        let (ra, rb) = tokio::join!(
            replicate_logs(&a, &mut ca, &config, &pa),
            replicate_logs(&b, &mut cb, &config, &pb),
        );
        let ra = ra.unwrap();
        rb.unwrap();

        // b's seq 2 links to an entry a does not hold at seq 1.
        assert_eq!(ra.invalid, 1);
        assert_eq!(a.length(&log).await.unwrap(), 1);
        assert_eq!(a.get_entry(&log, 1).await.unwrap().unwrap(), mine);
    }

    #[tokio::test]
    async fn test_conflicting_entry_becomes_fork_evidence() {
        let keypair = Keypair::generate();
        let author = keypair.device_id();
        let log = LogKey::derive(&author, "obs");
        let first = chain(&keypair, "obs", 1).remove(0);
        let second_a = EntryBuilder::new(author, log, 2)
            .prev(first.compute_id())
            .payload("a")
            .sign(&keypair);
        let second_b = EntryBuilder::new(author, log, 2)
            .prev(first.compute_id())
            .payload("b")
            .sign(&keypair);

        let store = store_with(&[first, second_a.clone()]).await;

        let mut stats = LogStats::default();
        ingest(&store, second_b.clone(), true, &mut stats).await.unwrap();
        assert_eq!(stats.forks, 1);
        assert_eq!(stats.entries_received, 0);

        let forks = store.get_forks(&log).await.unwrap();
        assert_eq!(forks.len(), 1);
        assert_eq!(forks[0].seq, 2);
        assert_eq!(forks[0].entry_id, second_b.compute_id());
        assert_eq!(store.get_entry(&log, 2).await.unwrap().unwrap(), second_a);
    }

    #[tokio::test]
    async fn test_tampered_entry_dropped() {
        let keypair = Keypair::generate();
        let mut entry = chain(&keypair, "obs", 1).remove(0);
        entry.payload = bytes::Bytes::from_static(b"tampered");
        let store = MemoryLogStore::new();

        let mut stats = LogStats::default();
        ingest(&store, entry.clone(), true, &mut stats).await.unwrap();
        assert_eq!(stats.invalid, 1);
        assert_eq!(store.length(entry.log()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_peer_vanishes() {
        let keypair = Keypair::generate();
        let a = store_with(&chain(&keypair, "x", 3)).await;
        let (mut ca, cb) = pair();
        drop(cb);

        let progress = reporter();
        let err = replicate_logs(&a, &mut ca, &SyncConfig::default(), &progress)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConnectionLost));
    }

    fn wire(message: &LogMessage) -> bytes::Bytes {
        encode(message).unwrap()
    }

    #[tokio::test]
    async fn test_finishing_side_knows_remote_stored_everything() {
        let keypair = Keypair::generate();
        let xs = chain(&keypair, "x", 30);
        let log = *xs[0].log();
        let a = store_with(&xs).await;
        let b = Arc::new(MemoryLogStore::new());

        let (mut ca, mut cb) = pair();
        let remote = tokio::spawn({
            let b = b.clone();
            async move {
                let progress = reporter();
                replicate_logs(&*b, &mut cb, &SyncConfig::default(), &progress).await
            }
        });

        let progress = reporter();
        let stats = replicate_logs(&a, &mut ca, &SyncConfig::default(), &progress)
            .await
            .unwrap();
        assert_eq!(stats.entries_sent, 30);
        // Checked before the remote task is awaited.
        assert_eq!(b.length(&log).await.unwrap(), 30);

        assert_eq!(remote.await.unwrap().unwrap().entries_received, 30);
    }

    #[tokio::test]
    async fn test_bulk_both_ways_through_tiny_window() {
        let (ka, kb) = (Keypair::generate(), Keypair::generate());
        let a = store_with(&chain(&ka, "x", 120)).await;
        let b = store_with(&chain(&kb, "y", 120)).await;

        let (mut ca, mut cb) = pair_with_window(1);
        let config = SyncConfig {
            max_batch_size: 1,
            ..SyncConfig::default()
        };
        let (pa, pb) = (reporter(), reporter());
        let both = async {
            tokio::join!(
                replicate_logs(&a, &mut ca, &config, &pa),
                replicate_logs(&b, &mut cb, &config, &pb),
            )
        };
        let (ra, rb) = tokio::time::timeout(Duration::from_secs(10), both)
            .await
            .expect("replication stalled");
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!((ra.entries_sent, ra.entries_received), (120, 120));
        assert_eq!((rb.entries_sent, rb.entries_received), (120, 120));
        assert_eq!(a.lengths().await.unwrap(), b.lengths().await.unwrap());
    }

    #[tokio::test]
    async fn test_remote_log_grows_mid_session() {
        let keypair = Keypair::generate();
        let late = chain(&keypair, "late", 3);
        let log = *late[0].log();
        let a = MemoryLogStore::new();

        let (mut ca, mut cb) = pair();
        // Heads say nothing; the log is announced only afterwards.
        let remote = async move {
            cb.send(wire(&LogMessage::EndOfHeads)).await.unwrap();
            cb.send(wire(&LogMessage::Have {
                logs: vec![(log, 3)],
            }))
            .await
            .unwrap();
            cb.send(wire(&LogMessage::Entries { entries: late })).await.unwrap();
            cb.send(wire(&LogMessage::Done)).await.unwrap();

            let mut seen = Vec::new();
            while !(seen.contains(&LogMessage::Done) && seen.contains(&LogMessage::Synced)) {
                let raw = cb.recv().await.unwrap().unwrap();
                seen.push(decode::<LogMessage>(&raw).unwrap());
            }
            cb.send(wire(&LogMessage::Synced)).await.unwrap();
            cb
        };

        let (config, progress) = (SyncConfig::default(), reporter());
        let (result, _cb) = tokio::join!(replicate_logs(&a, &mut ca, &config, &progress), remote);
        assert_eq!(result.unwrap().entries_received, 3);
        assert_eq!(a.length(&log).await.unwrap(), 3);

        let last = progress.finish();
        assert_eq!(last.db.total, 3);
        assert_eq!(last.db.sofar, 3);
    }

    #[tokio::test]
    async fn test_out_of_range_length_rejected() {
        let huge = LogMessage::Have {
            logs: vec![(LogKey::from_bytes([9; 32]), u64::MAX)],
        };
        // Once among the heads, once as a later announcement.
        for script in [
            vec![huge.clone(), LogMessage::EndOfHeads],
            vec![LogMessage::EndOfHeads, huge.clone()],
        ] {
            let keypair = Keypair::generate();
            let a = store_with(&chain(&keypair, "x", 2)).await;
            let (mut ca, mut cb) = pair();
            let remote = async move {
                for message in &script {
                    cb.send(wire(message)).await.unwrap();
                }
                cb
            };

            let (config, progress) = (SyncConfig::default(), reporter());
            let (result, _cb) = tokio::join!(replicate_logs(&a, &mut ca, &config, &progress), remote);
            assert!(matches!(
                result.unwrap_err(),
                SyncError::Protocol(ProtocolError::Unexpected(_))
            ));
        }
    }
}
