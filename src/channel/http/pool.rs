//! The idle keep-alive connection pool.
//!
//! Entries are keyed by the caller-supplied connection name and are
//! mutually exclusive: a check-in replaces any prior entry, a checkout
//! removes the entry and hands the stream back. An idle entry lives
//! for ten seconds; the peer hanging up evicts it early.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tracing::debug;

use super::connect::Upstream;

const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// A pooled stream plus any bytes read past the previous response.
pub(crate) struct Idle {
    pub(crate) stream: Upstream,
    pub(crate) leftover: BytesMut,
}

struct Entry {
    take: oneshot::Sender<oneshot::Sender<Idle>>,
}

/// The connection pool handle. Cheap to clone; owned by the agent's
/// event loop and shared with every HTTP channel.
#[derive(Clone)]
pub struct Pool {
    inner: Rc<RefCell<HashMap<String, Entry>>>,
}

impl Pool {
    pub fn new() -> Pool {
        Pool {
            inner: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Store an idle stream under `name`, replacing any prior entry.
    pub(crate) fn checkin(&self, name: &str, stream: Upstream, leftover: BytesMut) {
        let (take_tx, take_rx) = oneshot::channel();

        debug!("{}: pooling connection", name);
        // Replacing drops the previous entry's sender, which tells its
        // watcher task to discard that stream.
        self.inner
            .borrow_mut()
            .insert(name.to_string(), Entry { take: take_tx });

        let pool = Rc::downgrade(&self.inner);
        let name = name.to_string();
        tokio::task::spawn_local(watch_idle(pool, name, stream, leftover, take_rx));
    }

    /// Remove and return the stream checked in under `name`.
    pub(crate) async fn checkout(&self, name: &str) -> Option<Idle> {
        let entry = self.inner.borrow_mut().remove(name)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        entry.take.send(reply_tx).ok()?;
        let idle = reply_rx.await.ok()?;
        debug!("{}: reusing pooled connection", name);
        Some(idle)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.borrow().len()
    }
}

impl Default for Pool {
    fn default() -> Pool {
        Pool::new()
    }
}

async fn watch_idle(
    pool: std::rc::Weak<RefCell<HashMap<String, Entry>>>,
    name: String,
    mut stream: Upstream,
    mut leftover: BytesMut,
    mut take_rx: oneshot::Receiver<oneshot::Sender<Idle>>,
) {
    let expire = tokio::time::sleep(IDLE_TIMEOUT);
    tokio::pin!(expire);

    loop {
        tokio::select! {
            biased;

            taken = &mut take_rx => {
                if let Ok(reply) = taken {
                    let _ = reply.send(Idle { stream, leftover });
                }
                // Either checked out, or replaced by a newer check-in;
                // the map entry is no longer ours.
                return;
            }

            _ = &mut expire => {
                debug!("{}: pooled connection timed out", name);
                break;
            }

            read = stream.read_buf(&mut leftover) => {
                match read {
                    Ok(0) | Err(_) => {
                        debug!("{}: pooled connection closed", name);
                        break;
                    }
                    // Early bytes of the next response; keep them with
                    // the stream.
                    Ok(_) => continue,
                }
            }
        }
    }

    if let Some(pool) = pool.upgrade() {
        pool.borrow_mut().remove(&name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::LocalSet;

    fn upstream_pair() -> (Upstream, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        (Box::new(ours), theirs)
    }

    #[tokio::test]
    async fn checkin_checkout_returns_stream() {
        LocalSet::new()
            .run_until(async {
                let pool = Pool::new();
                let (stream, mut peer) = upstream_pair();
                pool.checkin("a", stream, BytesMut::new());

                let mut idle = pool.checkout("a").await.expect("entry present");
                assert!(pool.checkout("a").await.is_none());

                // Prove it's the same stream: bytes written to it come
                // out at the peer.
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                idle.stream.write_all(b"ping").await.unwrap();
                let mut buf = [0u8; 4];
                peer.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"ping");
            })
            .await;
    }

    #[tokio::test]
    async fn checkin_replaces_prior_entry() {
        LocalSet::new()
            .run_until(async {
                let pool = Pool::new();
                let (first, _first_peer) = upstream_pair();
                let (second, mut second_peer) = upstream_pair();

                pool.checkin("a", first, BytesMut::new());
                pool.checkin("a", second, BytesMut::new());
                assert_eq!(pool.len(), 1);

                let mut idle = pool.checkout("a").await.expect("entry present");
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                idle.stream.write_all(b"2").await.unwrap();
                let mut buf = [0u8; 1];
                second_peer.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"2");
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_drops_entry() {
        LocalSet::new()
            .run_until(async {
                let pool = Pool::new();
                let (stream, _peer) = upstream_pair();
                pool.checkin("a", stream, BytesMut::new());

                tokio::time::sleep(IDLE_TIMEOUT + Duration::from_secs(1)).await;
                tokio::task::yield_now().await;
                assert!(pool.checkout("a").await.is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn peer_close_drops_entry() {
        LocalSet::new()
            .run_until(async {
                let pool = Pool::new();
                let (stream, peer) = upstream_pair();
                pool.checkin("a", stream, BytesMut::new());

                drop(peer);
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;
                assert!(pool.checkout("a").await.is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn leftover_travels_with_stream() {
        LocalSet::new()
            .run_until(async {
                let pool = Pool::new();
                let (stream, _peer) = upstream_pair();
                pool.checkin("a", stream, BytesMut::from(&b"extra"[..]));

                let idle = pool.checkout("a").await.expect("entry present");
                assert_eq!(&idle.leftover[..], b"extra");
            })
            .await;
    }
}
