//! Pluggable connection backends for the provider.
//!
//! A [`Connector`] turns a target URL into a [`Duplex`]: a sink of outbound
//! frames and a stream of inbound ones. The provider only ever sees whole
//! frames; backends with message-size limits split and rejoin them
//! internally (see [`FragmentingConnector`]).
//!
//! ```text
//! WebsocketProvider
//!       │ Vec<u8> frames
//!       ▼
//! ┌──────────────────────┐    ┌──────────────────────┐
//! │ FragmentingConnector │ ─► │ WebSocketConnector   │ ─► tokio-tungstenite
//! │ (optional)           │    │                      │
//! └──────────────────────┘    └──────────────────────┘
//! ```

use futures_util::future::{self, BoxFuture};
use futures_util::{stream, Sink, SinkExt, Stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

/// Socket lifecycle, matching conventional WebSocket semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for ReadyState {
    fn from(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("connection closed")]
    Closed,
}

pub type FrameSink = Pin<Box<dyn Sink<Vec<u8>, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// An open connection, split into its two halves.
pub struct Duplex {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens connections for the provider.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Duplex, TransportError>>;
}

/// Plain WebSocket backend; frames travel as binary messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Duplex, TransportError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
            let (ws_sender, ws_receiver) = ws_stream.split();

            let sink = ws_sender
                .with(|data: Vec<u8>| {
                    future::ready(Ok::<_, tungstenite::Error>(Message::Binary(data.into())))
                })
                .sink_map_err(TransportError::from);

            let stream = ws_receiver.filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Binary(data)) => Some(Ok(data.to_vec())),
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::from(e))),
                })
            });

            Ok(Duplex {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Fragmentation
// ───────────────────────────────────────────────────────────────────

/// Upper bound on fragments per message.
const MAX_FRAGMENTS: u64 = 4096;
/// Partially received messages kept before the oldest is discarded.
const MAX_PENDING: usize = 64;

/// Bytes a fragment may add around its chunk when no fragment is larger
/// than `max_message`: message id, index, total and the chunk length prefix.
pub fn fragment_overhead(max_message: usize) -> usize {
    varint_len(u64::MAX) + 2 * varint_len(MAX_FRAGMENTS) + varint_len(max_message as u64)
}

fn varint_len(mut n: u64) -> usize {
    let mut len = 1;
    while n >= 0x80 {
        n >>= 7;
        len += 1;
    }
    len
}

/// Split `data` into fragments of at most `max_message` bytes each.
///
/// ```text
/// varuint message_id │ varuint index │ varuint total │ varUint8Array chunk
/// ```
///
/// A limit no larger than [`fragment_overhead`] cannot be honoured; such
/// fragments carry one payload byte each.
pub fn fragment(data: &[u8], max_message: usize) -> Vec<Vec<u8>> {
    let max_chunk = max_message
        .saturating_sub(fragment_overhead(max_message))
        .max(1);
    let message_id = Uuid::new_v4().as_u128() as u64;
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![data]
    } else {
        data.chunks(max_chunk).collect()
    };
    let total = chunks.len() as u64;
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let mut buf = Vec::with_capacity(chunk.len() + 16);
            buf.write_var(message_id);
            buf.write_var(index as u64);
            buf.write_var(total);
            buf.write_buf(chunk);
            buf
        })
        .collect()
}

fn read_fragment_header(
    fragment: &[u8],
) -> Result<(u64, u64, u64, Vec<u8>), yrs::encoding::read::Error> {
    let mut cursor = Cursor::new(fragment);
    let id: u64 = cursor.read_var()?;
    let index: u64 = cursor.read_var()?;
    let total: u64 = cursor.read_var()?;
    let chunk = cursor.read_buf()?.to_vec();
    Ok((id, index, total, chunk))
}

struct Partial {
    total: u64,
    received: u64,
    parts: Vec<Option<Vec<u8>>>,
}

/// Rebuilds whole frames from fragments, keyed by message id.
#[derive(Default)]
pub struct Reassembler {
    pending: HashMap<u64, Partial>,
    order: VecDeque<u64>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; returns the frame once all its fragments arrived.
    /// Malformed fragments are logged and skipped.
    pub fn push(&mut self, fragment: &[u8]) -> Option<Vec<u8>> {
        let header = read_fragment_header(fragment);
        let (id, index, total, chunk) = match header {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("Dropping malformed fragment: {e}");
                return None;
            }
        };
        if total == 0 || total > MAX_FRAGMENTS || index >= total {
            log::warn!("Dropping fragment {index}/{total} of message {id}");
            return None;
        }
        if total == 1 {
            return Some(chunk);
        }

        if !self.pending.contains_key(&id) {
            if self.pending.len() >= MAX_PENDING {
                if let Some(oldest) = self.order.pop_front() {
                    self.pending.remove(&oldest);
                }
            }
            self.order.push_back(id);
            self.pending.insert(
                id,
                Partial {
                    total,
                    received: 0,
                    parts: vec![None; total as usize],
                },
            );
        }

        let partial = self.pending.get_mut(&id)?;
        if partial.total != total {
            log::warn!("Fragment total mismatch for message {id}");
            return None;
        }
        let slot = &mut partial.parts[index as usize];
        if slot.is_none() {
            partial.received += 1;
        }
        *slot = Some(chunk);
        if partial.received < partial.total {
            return None;
        }

        let partial = self.pending.remove(&id)?;
        self.order.retain(|pending| *pending != id);
        Some(partial.parts.into_iter().flatten().flatten().collect())
    }

    /// Messages still waiting for fragments.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Wraps another connector whose messages may not exceed `max_message`
/// bytes, header included.
pub struct FragmentingConnector<C> {
    inner: C,
    max_message: usize,
}

impl<C: Connector> FragmentingConnector<C> {
    pub fn new(inner: C, max_message: usize) -> Self {
        if max_message <= fragment_overhead(max_message) {
            log::warn!("Message limit {max_message} leaves no room for fragment payload");
        }
        Self { inner, max_message }
    }
}

impl<C: Connector> Connector for FragmentingConnector<C> {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Duplex, TransportError>> {
        let connecting = self.inner.connect(url);
        let max_message = self.max_message;
        Box::pin(async move {
            let Duplex { sink, stream } = connecting.await?;

            let sink = sink.with_flat_map(move |data: Vec<u8>| {
                stream::iter(fragment(&data, max_message).into_iter().map(Ok))
            });

            let mut reassembler = Reassembler::new();
            let stream = stream.filter_map(move |item| {
                future::ready(match item {
                    Ok(chunk) => reassembler.push(&chunk).map(Ok),
                    Err(e) => Some(Err(e)),
                })
            });

            Ok(Duplex {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}
