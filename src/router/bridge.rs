//! External bridge processes: spawned once per matching rule, with the
//! peer's frames spliced through.

use std::cell::RefCell;
use std::collections::HashSet;
use std::os::unix::io::AsRawFd;
use std::process::Stdio;
use std::rc::Rc;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::fdpass;
use super::rules::Rule;
use super::RouterEvent;
use crate::transport::{Frame, Framing, Transport, TransportSender};
use crate::{frame, protocol, Error, Result};

pub(crate) struct Bridge {
    /// Sender towards the bridge process.
    pub(crate) tx: TransportSender,
    /// Channel ids currently routed to this bridge.
    pub(crate) channels: Rc<RefCell<HashSet<String>>>,
    pub(crate) privileged: bool,
    child: Option<tokio::process::Child>,
}

impl Bridge {
    /// Launch the rule's bridge and start splicing its frames to the
    /// peer. The `open` that triggered the launch is forwarded by the
    /// caller after this returns.
    pub(crate) async fn spawn(
        rule: &Rule,
        key: String,
        peer_tx: TransportSender,
        events: mpsc::UnboundedSender<RouterEvent>,
    ) -> Result<Bridge> {
        let argv = rule
            .spawn
            .as_ref()
            .filter(|argv| !argv.is_empty())
            .ok_or_else(Error::new_internal)?;

        let mut command = tokio::process::Command::new(&argv[0]);
        command.args(&argv[1..]);
        for assignment in &rule.environ {
            if let Some((key, value)) = assignment.split_once('=') {
                command.env(key, value);
            }
        }

        let channels = Rc::new(RefCell::new(HashSet::new()));

        let (tx, child) = if rule.privileged {
            spawn_privileged(command, key, peer_tx, &channels, events).await?
        } else {
            spawn_piped(command, key, peer_tx, &channels, events)?
        };

        // The bridge expects our init before anything else.
        let mut init = protocol::Init::default();
        init.host = Some("localhost".to_string());
        tx.control(&init.to_value()).await?;

        Ok(Bridge {
            tx,
            channels,
            privileged: rule.privileged,
            child: Some(child),
        })
    }

    /// The last channel was released, or the transport is going away.
    pub(crate) fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                debug!("terminating bridge {}", pid);
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            tokio::task::spawn_local(async move {
                let _ = child.wait().await;
            });
        }
    }
}

fn spawn_piped(
    mut command: tokio::process::Command,
    key: String,
    peer_tx: TransportSender,
    channels: &Rc<RefCell<HashSet<String>>>,
    events: mpsc::UnboundedSender<RouterEvent>,
) -> Result<(TransportSender, tokio::process::Child)> {
    command.stdin(Stdio::piped()).stdout(Stdio::piped());

    let mut child = command.spawn().map_err(|e| Error::new_not_found().with(e))?;
    let stdin = child.stdin.take().expect("stdin was piped");
    let stdout = child.stdout.take().expect("stdout was piped");

    let (transport, tx) = Transport::new(stdout, stdin, Framing::LengthPrefixed);
    tokio::task::spawn_local(relay(transport, key, peer_tx, channels.clone(), events));

    Ok((tx, child))
}

/// A privileged bridge is connected over a socketpair on its stdio.
/// Its first frame is the `send-stderr` control; it is answered by
/// passing our stderr before any other frame is written.
async fn spawn_privileged(
    mut command: tokio::process::Command,
    key: String,
    peer_tx: TransportSender,
    channels: &Rc<RefCell<HashSet<String>>>,
    events: mpsc::UnboundedSender<RouterEvent>,
) -> Result<(TransportSender, tokio::process::Child)> {
    let (parent, child_end) = std::os::unix::net::UnixStream::pair().map_err(Error::new_io)?;

    let stdin_end = child_end.try_clone().map_err(Error::new_io)?;
    command.stdin(Stdio::from(std::os::fd::OwnedFd::from(stdin_end)));
    command.stdout(Stdio::from(std::os::fd::OwnedFd::from(child_end)));

    let child = command.spawn().map_err(|e| Error::new_not_found().with(e))?;

    parent.set_nonblocking(true).map_err(Error::new_io)?;
    let mut parent = tokio::net::UnixStream::from_std(parent).map_err(Error::new_io)?;

    let body = frame::read_frame(&mut parent)
        .await?
        .ok_or_else(Error::new_terminated)?;
    let (channel, payload) = frame::split_frame(bytes::Bytes::from(body))?;
    let message = protocol::parse_control(&payload)?;
    if channel.is_some() || message.command != "send-stderr" {
        warn!("privileged bridge started with {:?} instead of send-stderr", message.command);
        return Err(Error::new_protocol());
    }

    loop {
        parent.writable().await.map_err(Error::new_io)?;
        match fdpass::send_fd(parent.as_raw_fd(), libc::STDERR_FILENO) {
            Ok(()) => break,
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(Error::new_io(err)),
        }
    }

    let (read_half, write_half) = tokio::io::split(parent);
    let (transport, tx) = Transport::new(read_half, write_half, Framing::LengthPrefixed);
    tokio::task::spawn_local(relay(transport, key, peer_tx, channels.clone(), events));

    Ok((tx, child))
}

/// Splice frames from the bridge to the peer. The bridge's own `init`
/// is swallowed; a `close` is only forwarded for channels still routed
/// here, and updates the router's bookkeeping.
async fn relay<R>(
    mut transport: Transport<R>,
    key: String,
    peer_tx: TransportSender,
    channels: Rc<RefCell<HashSet<String>>>,
    events: mpsc::UnboundedSender<RouterEvent>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match transport.recv().await {
            Ok(Some(Frame::Data(channel, payload))) => {
                if peer_tx.send(Some(&channel), payload).await.is_err() {
                    break;
                }
            }
            Ok(Some(Frame::Control(payload))) => {
                let message = match protocol::parse_control(&payload) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("bad control message from bridge: {}", err);
                        break;
                    }
                };

                match message.command.as_str() {
                    "init" => continue,
                    "close" => {
                        let known = match message.channel {
                            Some(ref channel) => channels.borrow_mut().remove(channel),
                            None => false,
                        };
                        if !known {
                            debug!("dropping bridge close for unknown channel");
                            continue;
                        }
                        let channel = message.channel.expect("known close has a channel");
                        if peer_tx.send(None, payload).await.is_err() {
                            break;
                        }
                        let _ = events.send(RouterEvent::BridgeChannelClosed(key.clone(), channel));
                    }
                    _ => {
                        if peer_tx.send(None, payload).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!("bridge transport failed: {}", err);
                break;
            }
        }
    }

    let _ = events.send(RouterEvent::BridgeExited(key));
}
