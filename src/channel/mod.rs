//! Channel lifecycle and the payload implementations.
//!
//! A channel is a logical stream multiplexed over the transport. The
//! router owns a table of open channels and feeds each one control and
//! data through a bounded queue; the channel task talks back to the
//! peer through the shared [`TransportSender`]. A channel moves through
//! `Preparing → Ready → Done | Closed` and must release any resource it
//! opened before its `close` is reported.

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{self, ControlMessage};
use crate::transport::TransportSender;
use crate::Result;

pub mod echo;
pub mod fs;
pub mod http;
pub mod null;
pub mod stream;

pub use self::http::pool::Pool;

/// Shared agent state reachable from every channel.
pub struct Context {
    /// The keep-alive connection pool for HTTP channels.
    pub pool: Pool,
    /// The package listing, absent in a privileged peer.
    pub packages: Option<crate::packages::Packages>,
}

/// Control delivered from the router to a channel task.
#[derive(Debug)]
pub enum ChannelCtl {
    /// A data frame for this channel.
    Recv(Bytes),
    /// The peer finished sending.
    Done,
    /// Close the channel. `reply` asks the channel to report the close
    /// back to the peer (a kill); a peer-initiated close does not.
    Close {
        problem: Option<String>,
        reply: bool,
    },
    /// Some other control message addressed to this channel.
    Control(ControlMessage),
}

/// Input to a channel implementation, as surfaced by [`ChannelIo::next`].
#[derive(Debug)]
pub enum ChannelInput {
    Data(Bytes),
    Done,
    Control(ControlMessage),
}

/// A channel's connection to the rest of the agent.
pub struct ChannelIo {
    id: String,
    options: Value,
    tx: TransportSender,
    rx: mpsc::Receiver<ChannelCtl>,
    reaper: mpsc::UnboundedSender<String>,
    sent_close: bool,
    pending_problem: Option<String>,
}

impl ChannelIo {
    pub(crate) fn new(
        id: String,
        options: Value,
        tx: TransportSender,
        rx: mpsc::Receiver<ChannelCtl>,
        reaper: mpsc::UnboundedSender<String>,
    ) -> ChannelIo {
        ChannelIo {
            id,
            options,
            tx,
            rx,
            reaper,
            sent_close: false,
            pending_problem: None,
        }
    }

    /// The channel id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The `open` options.
    pub fn options(&self) -> &Value {
        &self.options
    }

    /// Announce that the channel is ready for data.
    pub async fn ready(&self) -> Result<()> {
        self.tx
            .control(&protocol::ready(&self.id))
            .await
    }

    /// Send a data frame to the peer.
    pub async fn send_data(&self, payload: Bytes) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        self.tx.send(Some(&self.id), payload).await
    }

    /// Tell the peer we are finished sending.
    pub async fn send_done(&self) -> Result<()> {
        self.tx.control(&protocol::done(&self.id)).await
    }

    /// Send an arbitrary control message for this channel.
    pub async fn send_control(&self, mut message: Value) -> Result<()> {
        if let Some(object) = message.as_object_mut() {
            object.insert("channel".into(), Value::String(self.id.clone()));
        }
        self.tx.control(&message).await
    }

    /// The next input, or `None` once the channel must shut down.
    pub async fn next(&mut self) -> Option<ChannelInput> {
        match self.rx.recv().await {
            Some(ChannelCtl::Recv(bytes)) => Some(ChannelInput::Data(bytes)),
            Some(ChannelCtl::Done) => Some(ChannelInput::Done),
            Some(ChannelCtl::Close { problem, reply }) => {
                if reply {
                    self.pending_problem = problem;
                } else {
                    // The peer already considers the channel closed.
                    self.sent_close = true;
                }
                None
            }
            Some(ChannelCtl::Control(message)) => Some(ChannelInput::Control(message)),
            None => {
                self.sent_close = true;
                None
            }
        }
    }

    /// Report the close to the peer, once.
    pub async fn close(&mut self, problem: Option<&str>) {
        self.close_with(problem, Map::new()).await
    }

    /// Report the close with extra fields (e.g. a transaction tag).
    pub async fn close_with(&mut self, problem: Option<&str>, extra: Map<String, Value>) {
        if self.sent_close {
            return;
        }
        self.sent_close = true;

        let problem = problem
            .map(str::to_string)
            .or_else(|| self.pending_problem.take());
        let mut message = protocol::close(&self.id, problem.as_deref());
        if let Some(object) = message.as_object_mut() {
            for (key, value) in extra {
                object.insert(key, value);
            }
        }

        if self.tx.control(&message).await.is_err() {
            debug!("{}: transport gone before close", self.id);
        }
    }
}

impl Drop for ChannelIo {
    fn drop(&mut self) {
        if !self.sent_close {
            warn!("{}: channel dropped without close", self.id);
        }
        let _ = self.reaper.send(self.id.clone());
    }
}

type ChannelFuture = Pin<Box<dyn Future<Output = ()>>>;

/// A local payload implementation.
pub(crate) type Constructor = fn(ChannelIo, Rc<Context>) -> ChannelFuture;

fn open_null(io: ChannelIo, _ctx: Rc<Context>) -> ChannelFuture {
    Box::pin(null::run(io))
}

fn open_echo(io: ChannelIo, _ctx: Rc<Context>) -> ChannelFuture {
    Box::pin(echo::run(io))
}

fn open_http(io: ChannelIo, ctx: Rc<Context>) -> ChannelFuture {
    Box::pin(http::run(io, ctx))
}

fn open_stream(io: ChannelIo, ctx: Rc<Context>) -> ChannelFuture {
    Box::pin(stream::run(io, ctx))
}

fn open_fsread(io: ChannelIo, _ctx: Rc<Context>) -> ChannelFuture {
    Box::pin(fs::read(io))
}

fn open_fsreplace(io: ChannelIo, _ctx: Rc<Context>) -> ChannelFuture {
    Box::pin(fs::replace(io))
}

fn open_fslist(io: ChannelIo, _ctx: Rc<Context>) -> ChannelFuture {
    Box::pin(fs::list(io))
}

/// Payloads whose subsystems live in other processes (the internal
/// DBus bus, the websocket stack, polkit metrics, inotify); opening
/// them here reports `not-supported`.
fn open_unsupported(mut io: ChannelIo, _ctx: Rc<Context>) -> ChannelFuture {
    Box::pin(async move {
        debug!("{}: payload handled by an external bridge only", io.id());
        io.close(Some("not-supported")).await;
    })
}

/// The fixed payload table; lookup is exact on the payload string.
pub(crate) static PAYLOADS: &[(&str, Constructor)] = &[
    ("dbus-json3", open_unsupported),
    ("http-stream1", open_http),
    ("http-stream2", open_http),
    ("stream", open_stream),
    ("packet", open_unsupported),
    ("fsread1", open_fsread),
    ("fsreplace1", open_fsreplace),
    ("fswatch1", open_unsupported),
    ("fslist1", open_fslist),
    ("metrics1", open_unsupported),
    ("null", open_null),
    ("echo", open_echo),
    ("websocket-stream1", open_unsupported),
];

pub(crate) fn lookup(payload: &str) -> Option<Constructor> {
    PAYLOADS
        .iter()
        .find(|(name, _)| *name == payload)
        .map(|(_, constructor)| *constructor)
}

/// The payload names, for `--version` output.
pub fn payload_names() -> impl Iterator<Item = &'static str> {
    PAYLOADS.iter().map(|(name, _)| *name)
}
