//! Stream multiplexing over one connection.
//!
//! A [`Mux`] carries any number of named sub-streams (`handshake`, `rpc`,
//! `db`, `media`) over a single `AsyncRead + AsyncWrite`. Frames are
//! length-delimited:
//!
//! ```text
//! +-----+----------+------------------+-----------+
//! | tag | name_len | name (utf-8)     | body      |
//! | u8  | u8       | name_len bytes   | remaining |
//! +-----+----------+------------------+-----------+
//! ```
//!
//! `OPEN` announces a name, `DATA` carries one message, `CLOSE` half-closes
//! the sender's side. Opening is symmetric: if both peers open the same name
//! they get the two ends of one sub-stream. Names the remote opens first are
//! handed out by [`Mux::accept`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};
use tracing::{debug, trace, warn};

use crate::channel::{Channel, Event};
use crate::error::{MuxError, Result, SyncError};
use crate::messages::limits;

const TAG_OPEN: u8 = 1;
const TAG_DATA: u8 = 2;
const TAG_CLOSE: u8 = 3;

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Open { name: String },
    Data { name: String, body: Bytes },
    Close { name: String },
}

impl From<std::io::Error> for MuxError {
    fn from(e: std::io::Error) -> Self {
        MuxError::ConnectionLost(e.to_string())
    }
}

/// Length-delimited frame codec.
#[derive(Debug)]
pub(crate) struct FrameCodec {
    length: LengthDelimitedCodec,
}

impl FrameCodec {
    pub(crate) fn new() -> Self {
        Self {
            length: LengthDelimitedCodec::builder()
                .max_frame_length(limits::MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Frame>, MuxError> {
        let Some(mut frame) = self.length.decode(src)? else {
            return Ok(None);
        };

        if frame.len() < 2 {
            return Err(MuxError::MalformedFrame("frame shorter than header".into()));
        }
        let tag = frame.get_u8();
        let name_len = frame.get_u8() as usize;
        if frame.len() < name_len {
            return Err(MuxError::MalformedFrame("truncated stream name".into()));
        }
        let name = String::from_utf8(frame.split_to(name_len).to_vec())
            .map_err(|_| MuxError::MalformedFrame("stream name is not utf-8".into()))?;

        match tag {
            TAG_OPEN => Ok(Some(Frame::Open { name })),
            TAG_DATA => Ok(Some(Frame::Data {
                name,
                body: frame.freeze(),
            })),
            TAG_CLOSE => Ok(Some(Frame::Close { name })),
            other => Err(MuxError::MalformedFrame(format!("unknown tag {other}"))),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> std::result::Result<(), MuxError> {
        let (tag, name, body) = match frame {
            Frame::Open { name } => (TAG_OPEN, name, Bytes::new()),
            Frame::Data { name, body } => (TAG_DATA, name, body),
            Frame::Close { name } => (TAG_CLOSE, name, Bytes::new()),
        };
        let name_len = u8::try_from(name.len()).map_err(|_| MuxError::NameTooLong(name.len()))?;

        let mut buf = BytesMut::with_capacity(2 + name.len() + body.len());
        buf.put_u8(tag);
        buf.put_u8(name_len);
        buf.put_slice(name.as_bytes());
        buf.put_slice(&body);
        self.length.encode(buf.freeze(), dst)?;
        Ok(())
    }
}

enum Outbound {
    /// Data frames carry the sender's window permit until they are written.
    Frame(Frame, Option<OwnedSemaphorePermit>),
    Shutdown,
}

type Inbound = std::result::Result<Bytes, MuxError>;

struct Slot {
    /// Dropped on remote CLOSE or connection failure.
    tx: Option<mpsc::Sender<Inbound>>,
    /// Taken when the stream is opened locally.
    rx: Option<mpsc::Receiver<Inbound>>,
    local_open: bool,
    remote_open: bool,
    remote_closed: bool,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(limits::STREAM_WINDOW);
        Self {
            tx: Some(tx),
            rx: Some(rx),
            local_open: false,
            remote_open: false,
            remote_closed: false,
        }
    }
}

struct Slots {
    map: HashMap<String, Slot>,
    /// Names the remote opened first. Dropped with the connection, which
    /// ends [`Mux::accept`].
    accept: Option<mpsc::UnboundedSender<String>>,
    /// Set once the connection is gone; every later open fails with it.
    lost: Option<MuxError>,
}

struct Shared {
    outbound: mpsc::UnboundedSender<Outbound>,
    slots: Mutex<Slots>,
}

impl Shared {
    fn slots(&self) -> MutexGuard<'_, Slots> {
        // Slot bookkeeping stays consistent even if a holder panicked.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply one incoming frame. Data waits for room in the sub-stream's
    /// window, which stops the reader and pushes back on the remote.
    async fn dispatch(&self, frame: Frame) {
        let tx = {
            let mut slots = self.slots();
            match frame {
                Frame::Open { name } => {
                    let Slots { map, accept, .. } = &mut *slots;
                    let slot = map.entry(name.clone()).or_insert_with(Slot::new);
                    if slot.remote_open {
                        warn!(stream = %name, "remote opened sub-stream twice");
                        return;
                    }
                    slot.remote_open = true;
                    if !slot.local_open {
                        trace!(stream = %name, "remote opened sub-stream");
                        if let Some(accept) = accept {
                            let _ = accept.send(name);
                        }
                    }
                    return;
                }
                Frame::Close { name } => {
                    if let Some(slot) = slots.map.get_mut(&name) {
                        trace!(stream = %name, "remote closed sub-stream");
                        slot.tx = None;
                        slot.remote_closed = true;
                    }
                    return;
                }
                Frame::Data { name, body } => match slots.map.get(&name) {
                    Some(slot) => slot.tx.clone().map(|tx| (tx, body)),
                    None => {
                        warn!(stream = %name, "data for unopened sub-stream dropped");
                        None
                    }
                },
            }
        };
        if let Some((tx, body)) = tx {
            // A dropped receiver means the stream was discarded locally.
            let _ = tx.send(Ok(body)).await;
        }
    }

    fn fail(&self, reason: MuxError) {
        let mut slots = self.slots();
        if slots.lost.is_none() {
            slots.lost = Some(reason.clone());
        }
        slots.accept = None;
        for slot in slots.map.values_mut() {
            if let Some(tx) = slot.tx.take() {
                let _ = tx.try_send(Err(reason.clone()));
            }
        }
    }

    /// Why `name` ended without a CLOSE from the remote, if it did.
    fn ended(&self, name: &str) -> Option<MuxError> {
        let slots = self.slots();
        match slots.map.get(name) {
            Some(slot) if slot.remote_closed => None,
            _ => slots.lost.clone(),
        }
    }
}

/// A multiplexed connection.
pub struct Mux {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Mux {
    /// Wrap a connection. Spawns a reader and a writer task.
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, stream) = Framed::new(io, FrameCodec::new()).split();
        Self::with_transport(sink, stream)
    }

    fn with_transport<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Frame, Error = MuxError> + Send + Unpin + 'static,
        St: Stream<Item = std::result::Result<Frame, MuxError>> + Send + Unpin + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            outbound,
            slots: Mutex::new(Slots {
                map: HashMap::new(),
                accept: Some(accept_tx),
                lost: None,
            }),
        });

        let writer = tokio::spawn(write_loop(sink, outbound_rx, shared.clone()));
        let reader = tokio::spawn(read_loop(stream, shared.clone()));

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            tasks: Mutex::new(Some((reader, writer))),
        }
    }

    /// Open a named sub-stream. Opening a name the remote already opened
    /// connects to it; each name can be opened once per side.
    pub fn open(&self, name: &str) -> std::result::Result<SubStream, MuxError> {
        if name.len() > u8::MAX as usize {
            return Err(MuxError::NameTooLong(name.len()));
        }

        let mut slots = self.shared.slots();
        if let Some(reason) = &slots.lost {
            return Err(reason.clone());
        }

        let slot = slots.map.entry(name.to_string()).or_insert_with(Slot::new);
        let rx = match slot.rx.take() {
            Some(rx) if !slot.local_open => rx,
            _ => return Err(MuxError::AlreadyOpen(name.to_string())),
        };
        slot.local_open = true;

        self.shared
            .outbound
            .send(Outbound::Frame(
                Frame::Open {
                    name: name.to_string(),
                },
                None,
            ))
            .map_err(|_| MuxError::ConnectionLost("writer stopped".into()))?;

        debug!(stream = name, "opened sub-stream");
        Ok(SubStream {
            name: name.to_string(),
            shared: self.shared.clone(),
            window: Arc::new(Semaphore::new(limits::STREAM_WINDOW)),
            reserved: None,
            rx,
            closed: false,
        })
    }

    /// Wait for the next sub-stream the remote opened and we have not.
    ///
    /// Returns `None` once the connection is gone.
    pub async fn accept(&self) -> Option<SubStream> {
        let mut accept_rx = self.accept_rx.lock().await;
        while let Some(name) = accept_rx.recv().await {
            match self.open(&name) {
                Ok(stream) => return Some(stream),
                // Opened locally in the meantime.
                Err(MuxError::AlreadyOpen(_)) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    /// Flush pending frames, close the connection and end every sub-stream.
    pub async fn close(&self) {
        let _ = self.shared.outbound.send(Outbound::Shutdown);
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((reader, writer)) = tasks {
            let _ = writer.await;
            reader.abort();
            let _ = reader.await;
        }
        self.shared.fail(MuxError::Closed);
        debug!("multiplexer closed");
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        if let Some((reader, writer)) = self.tasks.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reader.abort();
            writer.abort();
        }
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
) where
    S: Sink<Frame, Error = MuxError> + Unpin,
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame, permit) => {
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "mux writer stopped");
                    let reason = match e {
                        MuxError::ConnectionLost(_) => e,
                        other => MuxError::ConnectionLost(other.to_string()),
                    };
                    shared.fail(reason);
                    return;
                }
                drop(permit);
            }
            Outbound::Shutdown => break,
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<S>(mut stream: S, shared: Arc<Shared>)
where
    S: Stream<Item = std::result::Result<Frame, MuxError>> + Unpin,
{
    let reason = loop {
        match stream.next().await {
            Some(Ok(frame)) => shared.dispatch(frame).await,
            Some(Err(e)) => break e,
            None => break MuxError::ConnectionLost("end of stream".into()),
        }
    };
    debug!(reason = %reason, "mux reader stopped");
    shared.fail(reason);
}

/// One end of a named sub-stream.
pub struct SubStream {
    name: String,
    shared: Arc<Shared>,
    /// Data frames of ours not yet written to the connection.
    window: Arc<Semaphore>,
    reserved: Option<OwnedSemaphorePermit>,
    rx: mpsc::Receiver<Inbound>,
    closed: bool,
}

impl SubStream {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn received(&self, message: Option<Inbound>) -> Result<Option<Bytes>> {
        match message {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e.into()),
            None => match self.shared.ended(&self.name) {
                Some(reason) => Err(reason.into()),
                None => Ok(None),
            },
        }
    }

    fn send_close(&mut self) {
        self.closed = true;
        self.reserved = None;
        let _ = self.shared.outbound.send(Outbound::Frame(
            Frame::Close {
                name: self.name.clone(),
            },
            None,
        ));
    }
}

impl std::fmt::Debug for SubStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubStream")
            .field("name", &self.name)
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl Channel for SubStream {
    async fn send(&mut self, message: Bytes) -> Result<()> {
        if self.closed {
            return Err(SyncError::Sync(format!("send on closed sub-stream {}", self.name)));
        }
        let permit = match self.reserved.take() {
            Some(permit) => permit,
            None => self
                .window
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| SyncError::ConnectionLost)?,
        };
        self.shared
            .outbound
            .send(Outbound::Frame(
                Frame::Data {
                    name: self.name.clone(),
                    body: message,
                },
                Some(permit),
            ))
            .map_err(|_| SyncError::ConnectionLost)
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        let message = self.rx.recv().await;
        self.received(message)
    }

    async fn next_event(&mut self, sending: bool) -> Result<Event> {
        if self.closed && sending {
            return Err(SyncError::Sync(format!("send on closed sub-stream {}", self.name)));
        }
        if sending && self.reserved.is_some() {
            return Ok(Event::Writable);
        }
        let window = self.window.clone();
        let reserve = async move {
            if sending {
                window.acquire_owned().await.ok()
            } else {
                std::future::pending().await
            }
        };

        tokio::select! {
            message = self.rx.recv() => self.received(message).map(Event::Received),
            permit = reserve => {
                self.reserved = Some(permit.ok_or(SyncError::ConnectionLost)?);
                Ok(Event::Writable)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.send_close();
            trace!(stream = %self.name, "closed sub-stream");
        }
        Ok(())
    }
}

impl Drop for SubStream {
    fn drop(&mut self) {
        if !self.closed {
            self.send_close();
        }
    }
}
