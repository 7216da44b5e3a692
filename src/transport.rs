//! The framed byte-stream carrier between the agent and its peer.
//!
//! A [`Transport`] decodes inbound frames into control and data
//! messages; the matching [`TransportSender`] queues outbound frames
//! into a bounded buffer drained by a writer task, so that slow writes
//! apply backpressure to senders instead of blocking the read loop.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::frame;
use crate::{Error, Result};

/// How many outbound frames may be queued before senders suspend.
const SEND_QUEUE_DEPTH: usize = 64;

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A frame with an empty channel prefix: a JSON control message.
    Control(Bytes),
    /// A frame addressed to a channel.
    Data(String, Bytes),
}

/// Which framing convention the transport speaks.
#[derive(Debug, Clone)]
pub enum Framing {
    /// `len\n` prefixed frames, the stdio protocol.
    LengthPrefixed,
    /// Frames delimited by `\n<boundary>\n`, for `--interact` debugging.
    /// `color` wraps written frames in bold/reset escapes for a TTY.
    Boundary { boundary: String, color: bool },
}

impl Framing {
    /// The interact framing, uncolored.
    pub fn boundary(boundary: &str) -> Framing {
        Framing::Boundary {
            boundary: boundary.to_string(),
            color: false,
        }
    }
}

enum OutMsg {
    Frame(Option<String>, Bytes),
}

/// The read half of a transport.
pub struct Transport<R> {
    reader: R,
    framing: Framing,
    /// Read-ahead; frames are parsed out of here.
    buf: BytesMut,
    eof: bool,
    writer_task: JoinHandle<()>,
}

/// A clonable handle for queueing outbound frames.
#[derive(Clone)]
pub struct TransportSender {
    tx: mpsc::Sender<OutMsg>,
}

impl TransportSender {
    /// Frame and queue a payload. Suspends while the outbound buffer is
    /// full; fails once the transport is gone.
    pub async fn send(&self, channel: Option<&str>, payload: Bytes) -> Result<()> {
        self.tx
            .send(OutMsg::Frame(channel.map(str::to_owned), payload))
            .await
            .map_err(|_| Error::new_terminated())
    }

    /// Serialize and queue a control message.
    pub async fn control(&self, message: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(message).map_err(|e| Error::new_internal().with(e))?;
        self.send(None, Bytes::from(body)).await
    }
}

impl<R> Transport<R>
where
    R: AsyncRead + Unpin,
{
    /// Create a transport over a pair of byte streams. The writer is
    /// moved into a background task; the reader is polled by `recv`.
    pub fn new<W>(reader: R, writer: W, framing: Framing) -> (Transport<R>, TransportSender)
    where
        W: AsyncWrite + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let writer_task = tokio::task::spawn_local(write_loop(writer, rx, framing.clone()));

        (
            Transport {
                reader,
                framing,
                buf: BytesMut::new(),
                eof: false,
                writer_task,
            },
            TransportSender { tx },
        )
    }

    /// Receive the next frame. `Ok(None)` means the peer closed; an
    /// error means the transport must be torn down with its problem.
    ///
    /// Cancel-safe: a partially buffered frame stays buffered, so this
    /// may sit in a `select!` next to other events.
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        let body = match self.framing {
            Framing::LengthPrefixed => {
                match read_prefixed(&mut self.reader, &mut self.buf, &mut self.eof).await? {
                    Some(body) => body,
                    None => return Ok(None),
                }
            }
            Framing::Boundary { ref boundary, .. } => {
                let delimiter = format!("\n{}\n", boundary).into_bytes();
                match read_delimited(&mut self.reader, &mut self.buf, &mut self.eof, &delimiter)
                    .await?
                {
                    Some(body) => body,
                    None => return Ok(None),
                }
            }
        };

        let (channel, payload) = frame::split_frame(body)?;
        trace!(
            channel = channel.as_deref().unwrap_or(""),
            len = payload.len(),
            "received frame"
        );

        Ok(Some(match channel {
            Some(id) => Frame::Data(id, payload),
            None => Frame::Control(payload),
        }))
    }

    /// Stop the writer task. Queued frames that were not yet written
    /// are dropped.
    pub fn shutdown(self) {
        self.writer_task.abort();
    }
}

/// Parse one length-prefixed frame out of the buffer, reading more as
/// needed. Unlike the exact-read codec in [`frame`], this may buffer
/// past the frame; the surplus feeds the next call.
async fn read_prefixed<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    eof: &mut bool,
) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    loop {
        match frame::parse_length(buf)? {
            Some((size, consumed)) if buf.len() >= consumed + size => {
                let mut whole = buf.split_to(consumed + size);
                let body = whole.split_off(consumed);
                return Ok(Some(body.freeze()));
            }
            _ => {}
        }

        if *eof {
            if buf.is_empty() {
                return Ok(None);
            }
            debug!("transport ended mid-frame");
            return Err(Error::new_bad_message());
        }

        let n = reader.read_buf(buf).await.map_err(Error::new_io)?;
        if n == 0 {
            *eof = true;
        }
    }
}

/// Scan buffered input for the delimiter, reading more as needed.
async fn read_delimited<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    eof: &mut bool,
    delimiter: &[u8],
) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find(buf, delimiter) {
            let message = buf.split_to(pos).freeze();
            let _ = buf.split_to(delimiter.len());
            if message.is_empty() {
                continue;
            }
            return Ok(Some(message));
        }

        if *eof {
            if !buf.is_empty() {
                debug!("discarding {} trailing bytes", buf.len());
                buf.clear();
            }
            return Ok(None);
        }

        let n = reader.read_buf(buf).await.map_err(Error::new_io)?;
        if n == 0 {
            *eof = true;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<OutMsg>, framing: Framing)
where
    W: AsyncWrite + Unpin,
{
    while let Some(OutMsg::Frame(channel, payload)) = rx.recv().await {
        let result = match framing {
            Framing::LengthPrefixed => {
                frame::write_frame(&mut writer, channel.as_deref(), &payload).await
            }
            Framing::Boundary {
                ref boundary,
                color,
            } => write_boundary(&mut writer, channel.as_deref(), &payload, boundary, color).await,
        };

        if let Err(err) = result {
            warn!("couldn't write frame: {}", err);
            break;
        }
    }
}

async fn write_boundary<W>(
    writer: &mut W,
    channel: Option<&str>,
    payload: &[u8],
    boundary: &str,
    colored: bool,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(payload.len() + boundary.len() + 16);
    if colored {
        out.extend_from_slice(b"\x1b[1m");
    }
    out.extend_from_slice(channel.unwrap_or("").as_bytes());
    out.push(b'\n');
    out.extend_from_slice(payload);
    out.push(b'\n');
    out.extend_from_slice(boundary.as_bytes());
    out.push(b'\n');
    if colored {
        out.extend_from_slice(b"\x1b[0m");
    }

    writer.write_all(&out).await.map_err(Error::new_io)?;
    writer.flush().await.map_err(Error::new_io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::LocalSet;

    async fn recv_all<R: AsyncRead + Unpin>(transport: &mut Transport<R>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = transport.recv().await.unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn length_prefixed_recv() {
        LocalSet::new()
            .run_until(async {
                let input: &[u8] = b"19\n\n{\"command\":\"init\"}9\nc1\nhello!";
                let (mut transport, _tx) =
                    Transport::new(input, tokio::io::sink(), Framing::LengthPrefixed);

                let frames = recv_all(&mut transport).await;
                assert_eq!(
                    frames,
                    vec![
                        Frame::Control(Bytes::from_static(b"{\"command\":\"init\"}")),
                        Frame::Data("c1".into(), Bytes::from_static(b"hello!")),
                    ]
                );
            })
            .await;
    }

    #[tokio::test]
    async fn malformed_frame_is_error() {
        LocalSet::new()
            .run_until(async {
                let input: &[u8] = b"0\nnope";
                let (mut transport, _tx) =
                    Transport::new(input, tokio::io::sink(), Framing::LengthPrefixed);
                let err = transport.recv().await.unwrap_err();
                assert_eq!(err.problem(), "protocol-error");
            })
            .await;
    }

    #[tokio::test]
    async fn sender_writes_frames() {
        LocalSet::new()
            .run_until(async {
                let (peer, ours) = tokio::io::duplex(4096);
                let (peer_read, _peer_write) = tokio::io::split(peer);
                let (ours_read, ours_write) = tokio::io::split(ours);

                let (_transport, tx) =
                    Transport::new(ours_read, ours_write, Framing::LengthPrefixed);
                tx.send(Some("9"), Bytes::from_static(b"payload"))
                    .await
                    .unwrap();
                drop(tx);

                let (mut check, _check_tx) =
                    Transport::new(peer_read, tokio::io::sink(), Framing::LengthPrefixed);
                let frame = check.recv().await.unwrap().unwrap();
                assert_eq!(frame, Frame::Data("9".into(), Bytes::from_static(b"payload")));
            })
            .await;
    }

    #[tokio::test]
    async fn recv_across_split_reads() {
        LocalSet::new()
            .run_until(async {
                // The frame arrives in awkward pieces and must be
                // reassembled.
                let reader = tokio_test::io::Builder::new()
                    .read(b"9")
                    .read(b"\nc1")
                    .read(b"\nhel")
                    .read(b"lo!")
                    .build();
                let (mut transport, _tx) =
                    Transport::new(reader, tokio::io::sink(), Framing::LengthPrefixed);

                let frame = transport.recv().await.unwrap().unwrap();
                assert_eq!(frame, Frame::Data("c1".into(), Bytes::from_static(b"hello!")));
                assert!(transport.recv().await.unwrap().is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn boundary_recv() {
        LocalSet::new()
            .run_until(async {
                let input: &[u8] = b"\n{\"command\":\"init\"}\n---\nc1\ndata\n---\n";
                let (mut transport, _tx) =
                    Transport::new(input, tokio::io::sink(), Framing::boundary("---"));

                let frames = recv_all(&mut transport).await;
                assert_eq!(
                    frames,
                    vec![
                        Frame::Control(Bytes::from_static(b"{\"command\":\"init\"}")),
                        Frame::Data("c1".into(), Bytes::from_static(b"data")),
                    ]
                );
            })
            .await;
    }

    #[tokio::test]
    async fn boundary_roundtrip() {
        LocalSet::new()
            .run_until(async {
                let (peer, ours) = tokio::io::duplex(4096);
                let (peer_read, _peer_write) = tokio::io::split(peer);
                let (ours_read, ours_write) = tokio::io::split(ours);

                let framing = Framing::boundary("==");
                let (_transport, tx) = Transport::new(ours_read, ours_write, framing.clone());
                tx.send(None, Bytes::from_static(b"{}")).await.unwrap();
                drop(tx);

                let (mut check, _check_tx) = Transport::new(peer_read, tokio::io::sink(), framing);
                let frame = check.recv().await.unwrap().unwrap();
                assert_eq!(frame, Frame::Control(Bytes::from_static(b"{}")));
            })
            .await;
    }
}
