//! Shared helpers for integration tests: an in-memory peer driving a
//! router, and a scripted upstream HTTP server.

#![allow(dead_code)]

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf};
use tokio::net::TcpListener;

use cockpit_bridge::channel::{Context, Pool};
use cockpit_bridge::packages::Packages;
use cockpit_bridge::router::Router;
use cockpit_bridge::transport::{Frame, Framing, Transport, TransportSender};

/// The test's side of the agent's transport.
pub struct Peer {
    pub transport: Transport<ReadHalf<DuplexStream>>,
    pub tx: TransportSender,
}

impl Peer {
    pub async fn send_control(&self, message: Value) {
        self.tx.control(&message).await.unwrap();
    }

    pub async fn send_data(&self, channel: &str, payload: &[u8]) {
        self.tx
            .send(Some(channel), Bytes::copy_from_slice(payload))
            .await
            .unwrap();
    }

    pub async fn init(&self) {
        self.send_control(json!({"command": "init", "version": 1}))
            .await;
    }

    pub async fn recv(&mut self) -> Frame {
        self.transport.recv().await.unwrap().expect("frame")
    }

    pub async fn recv_control(&mut self) -> Value {
        match self.recv().await {
            Frame::Control(payload) => serde_json::from_slice(&payload).unwrap(),
            Frame::Data(channel, payload) => {
                panic!("unexpected data frame for {}: {:?}", channel, payload)
            }
        }
    }

    pub async fn recv_data(&mut self, channel: &str) -> Bytes {
        match self.recv().await {
            Frame::Data(ch, payload) => {
                assert_eq!(ch, channel);
                payload
            }
            Frame::Control(payload) => panic!(
                "unexpected control frame: {}",
                String::from_utf8_lossy(&payload)
            ),
        }
    }

    /// Drive one HTTP channel to completion: returns the header frame
    /// and the data frames that preceded `done`/`close`.
    pub async fn collect_http_response(&mut self, channel: &str) -> (Value, Vec<Bytes>) {
        let ready = self.recv_control().await;
        assert_eq!(ready["command"], "ready", "expected ready, got {}", ready);
        assert_eq!(ready["channel"], channel);

        let head: Value = serde_json::from_slice(&self.recv_data(channel).await).unwrap();

        let mut blocks = Vec::new();
        loop {
            match self.recv().await {
                Frame::Data(ch, payload) => {
                    assert_eq!(ch, channel);
                    blocks.push(payload);
                }
                Frame::Control(payload) => {
                    let control: Value = serde_json::from_slice(&payload).unwrap();
                    match control["command"].as_str().unwrap() {
                        "done" => {
                            let close = self.recv_control().await;
                            assert_eq!(close["command"], "close");
                            assert!(close.get("problem").is_none(), "close: {}", close);
                            break;
                        }
                        "close" => panic!("close without done: {}", control),
                        other => panic!("unexpected control {}", other),
                    }
                }
            }
        }

        (head, blocks)
    }

    /// Expect the channel to fail with the given problem.
    pub async fn expect_close_problem(&mut self, channel: &str, problem: &str) {
        loop {
            match self.recv().await {
                Frame::Control(payload) => {
                    let control: Value = serde_json::from_slice(&payload).unwrap();
                    if control["command"] == "close" {
                        assert_eq!(control["channel"], channel);
                        assert_eq!(control["problem"], problem, "close: {}", control);
                        return;
                    }
                }
                Frame::Data(..) => {}
            }
        }
    }
}

/// Wire a router to an in-memory peer and run it in the background.
pub fn start_agent(packages: Option<Packages>) -> Peer {
    let (peer_side, agent_side) = tokio::io::duplex(1024 * 1024);
    let (peer_read, peer_write) = tokio::io::split(peer_side);
    let (agent_read, agent_write) = tokio::io::split(agent_side);

    let (peer_transport, peer_tx) = Transport::new(peer_read, peer_write, Framing::LengthPrefixed);
    let (mut agent_transport, agent_tx) =
        Transport::new(agent_read, agent_write, Framing::LengthPrefixed);

    let ctx = Rc::new(Context {
        pool: Pool::new(),
        packages,
    });

    tokio::task::spawn_local(async move {
        let mut router = Router::new(agent_tx, ctx, false);
        let _ = router.run(&mut agent_transport).await;
    });

    Peer {
        transport: peer_transport,
        tx: peer_tx,
    }
}

/// A scripted HTTP upstream: serves the given responses in order,
/// possibly several per connection, and counts accepted connections.
pub async fn upstream_server(responses: Vec<Vec<u8>>) -> (SocketAddr, Rc<RefCell<usize>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let accepts = Rc::new(RefCell::new(0));

    let counter = accepts.clone();
    let responses = Rc::new(RefCell::new(std::collections::VecDeque::from(responses)));

    tokio::task::spawn_local(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            *counter.borrow_mut() += 1;

            let responses = responses.clone();
            tokio::task::spawn_local(async move {
                let mut buf = Vec::new();
                loop {
                    // Wait for a complete request head.
                    let mut scratch = [0u8; 4096];
                    let head_end = loop {
                        if let Some(pos) = find(&buf, b"\r\n\r\n") {
                            break pos + 4;
                        }
                        match stream.read(&mut scratch).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&scratch[..n]),
                        }
                    };
                    buf.drain(..head_end);

                    let response = match responses.borrow_mut().pop_front() {
                        Some(response) => response,
                        None => return,
                    };
                    if stream.write_all(&response).await.is_err() {
                        return;
                    }
                    // Close once the script runs out, which also ends
                    // any until-EOF response.
                    if responses.borrow().is_empty() {
                        return;
                    }
                }
            });
        }
    });

    (address, accepts)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// A plain blocking-style HTTP GET against the internal package
/// server, returning status, headers, and body.
pub async fn http_get(
    address: SocketAddr,
    path: &str,
    headers: &[(&str, &str)],
) -> (u16, Vec<(String, String)>, Vec<u8>) {
    let mut stream = tokio::net::TcpStream::connect(address).await.unwrap();

    let mut request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n", path);
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let head_end = find(&raw, b"\r\n\r\n").expect("response head") + 4;
    let head = String::from_utf8_lossy(&raw[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let status: u16 = lines
        .next()
        .unwrap()
        .split(' ')
        .nth(1)
        .unwrap()
        .parse()
        .unwrap();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(": "))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();

    (status, headers, raw[head_end..].to_vec())
}

pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}
