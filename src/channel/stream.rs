//! The `stream` payload: a raw byte stream to a spawned process or a
//! socket endpoint.

use std::process::Stdio;
use std::rc::Rc;

use bytes::BytesMut;
use serde_json::{json, Map};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::http::connect::Connectable;
use super::{ChannelInput, ChannelIo, Context};
use crate::json as opt;

const READ_BLOCK: usize = 16 * 1024;

pub async fn run(mut io: ChannelIo, ctx: Rc<Context>) {
    match opt::get_strv(io.options(), "spawn") {
        Ok(Some(argv)) => run_spawn(io, argv).await,
        Ok(None) => run_connect(io, ctx).await,
        Err(_) => io.close(Some("protocol-error")).await,
    }
}

async fn run_spawn(mut io: ChannelIo, argv: Vec<String>) {
    if argv.is_empty() {
        return io.close(Some("protocol-error")).await;
    }

    let environ = match opt::get_strv(io.options(), "environ") {
        Ok(environ) => environ.unwrap_or_default(),
        Err(_) => return io.close(Some("protocol-error")).await,
    };
    let directory = match opt::get_str(io.options(), "directory") {
        Ok(directory) => directory.map(str::to_owned),
        Err(_) => return io.close(Some("protocol-error")).await,
    };

    let mut command = tokio::process::Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped());
    for assignment in &environ {
        if let Some((key, value)) = assignment.split_once('=') {
            command.env(key, value);
        }
    }
    if let Some(directory) = directory {
        command.current_dir(directory);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            debug!("couldn't spawn {}: {}", argv[0], err);
            return io.close(Some("not-found")).await;
        }
    };

    if io.ready().await.is_err() {
        let _ = child.start_kill();
        return io.close(Some("terminated")).await;
    }

    let mut stdin = child.stdin.take();
    let mut stdout = child.stdout.take().expect("stdout was piped");

    let mut buf = BytesMut::with_capacity(READ_BLOCK);
    loop {
        buf.clear();
        tokio::select! {
            input = io.next() => match input {
                Some(ChannelInput::Data(bytes)) => {
                    if let Some(ref mut pipe) = stdin {
                        if pipe.write_all(&bytes).await.is_err() {
                            stdin = None;
                        }
                    }
                }
                Some(ChannelInput::Done) => {
                    // Half-close towards the child.
                    stdin = None;
                }
                Some(ChannelInput::Control(message)) => {
                    debug!("stream: ignoring control {}", message.command);
                }
                None => {
                    let _ = child.start_kill();
                    return io.close(None).await;
                }
            },
            read = stdout.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {
                    if io.send_data(buf.clone().freeze()).await.is_err() {
                        let _ = child.start_kill();
                        return io.close(Some("terminated")).await;
                    }
                }
                Err(err) => {
                    warn!("stream read: {}", err);
                    break;
                }
            },
        }
    }

    let _ = io.send_done().await;

    let mut extra = Map::new();
    match child.wait().await {
        Ok(status) => {
            if let Some(code) = status.code() {
                extra.insert("exit-status".into(), json!(code));
            } else {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(signal) = status.signal() {
                        extra.insert("exit-signal".into(), json!(signal));
                    }
                }
            }
        }
        Err(err) => {
            warn!("stream wait: {}", err);
        }
    }

    io.close_with(None, extra).await;
}

async fn run_connect(mut io: ChannelIo, ctx: Rc<Context>) {
    let connectable = match Connectable::parse(io.options(), &ctx) {
        Ok(connectable) => connectable,
        Err(err) => return io.close(Some(err.problem())).await,
    };

    let upstream = match connectable.connect().await {
        Ok(upstream) => upstream,
        Err(err) => {
            debug!("stream connect {}: {}", connectable.name(), err);
            return io.close(Some(err.problem())).await;
        }
    };

    if io.ready().await.is_err() {
        return io.close(Some("terminated")).await;
    }

    splice(&mut io, upstream).await;
}

async fn splice<S>(io: &mut ChannelIo, upstream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read_half, mut write_half) = tokio::io::split(upstream);
    let mut write_open = true;

    let mut buf = BytesMut::with_capacity(READ_BLOCK);
    loop {
        buf.clear();
        tokio::select! {
            input = io.next() => match input {
                Some(ChannelInput::Data(bytes)) => {
                    if write_open && write_half.write_all(&bytes).await.is_err() {
                        write_open = false;
                    }
                }
                Some(ChannelInput::Done) => {
                    let _ = write_half.shutdown().await;
                    write_open = false;
                }
                Some(ChannelInput::Control(message)) => {
                    debug!("stream: ignoring control {}", message.command);
                }
                None => return io.close(None).await,
            },
            read = read_half.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {
                    if io.send_data(buf.clone().freeze()).await.is_err() {
                        return io.close(Some("terminated")).await;
                    }
                }
                Err(err) => {
                    debug!("stream read: {}", err);
                    return io.close(Some("terminated")).await;
                }
            },
        }
    }

    let _ = io.send_done().await;
    io.close(None).await;
}
