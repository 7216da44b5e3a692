//! The channel router: consumes control messages from the transport,
//! manages the per-channel lifecycle, matches `open` requests to local
//! payloads or external bridges, and multiplexes many channels over
//! one transport.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::channel::{self, ChannelCtl, ChannelIo, Context};
use crate::protocol::{self, ControlMessage};
use crate::transport::{Frame, Transport, TransportSender};
use crate::{json as opt, Error, Result};

mod bridge;
pub mod fdpass;
pub mod rules;

use bridge::Bridge;
use rules::Rule;

/// How many recently-closed channel ids are remembered, so stray
/// frames for them are dropped quietly instead of warned about.
const CLOSED_RING: usize = 64;

/// Notifications from channel tasks and bridge relays back to the
/// router loop.
pub(crate) enum RouterEvent {
    BridgeChannelClosed(String, String),
    BridgeExited(String),
}

enum Entry {
    Local {
        ctl: mpsc::Sender<ChannelCtl>,
        host: Option<String>,
        group: Option<String>,
    },
    Bridged {
        key: String,
        host: Option<String>,
        group: Option<String>,
    },
}

impl Entry {
    fn host(&self) -> Option<&str> {
        match self {
            Entry::Local { host, .. } | Entry::Bridged { host, .. } => host.as_deref(),
        }
    }

    fn group(&self) -> Option<&str> {
        match self {
            Entry::Local { group, .. } | Entry::Bridged { group, .. } => group.as_deref(),
        }
    }
}

#[derive(Default)]
struct RuleSet {
    /// Package rules, strongest first; checked before the payload table.
    rules: Vec<Rule>,
    /// Privileged rules; eligible once the peer announced superuser
    /// use, and checked after the package rules.
    late: Vec<Rule>,
}

/// A handle for replacing the router's rules while it runs, e.g. when
/// the package listing reloads.
#[derive(Clone)]
pub struct RulesHandle {
    set: Rc<std::cell::RefCell<RuleSet>>,
}

impl RulesHandle {
    /// Install the rules extracted from package manifests, replacing
    /// any previous set. Running bridges stay attached.
    pub fn set(&self, values: &[Value]) {
        let mut set = self.set.borrow_mut();
        set.rules.clear();
        set.late.clear();
        for rule in values.iter().filter_map(Rule::from_value) {
            if rule.privileged {
                set.late.push(rule);
            } else {
                set.rules.push(rule);
            }
        }
    }
}

pub struct Router {
    tx: TransportSender,
    ctx: Rc<Context>,
    channels: HashMap<String, Entry>,
    recently_closed: VecDeque<String>,
    rules: Rc<std::cell::RefCell<RuleSet>>,
    superuser: bool,
    init_received: bool,
    bridges: HashMap<String, Bridge>,
    last_privileged: Option<String>,
    reaper_tx: mpsc::UnboundedSender<String>,
    reaper_rx: mpsc::UnboundedReceiver<String>,
    events_tx: mpsc::UnboundedSender<RouterEvent>,
    events_rx: mpsc::UnboundedReceiver<RouterEvent>,
}

impl Router {
    /// `init_received` pretends the peer's init already arrived, for
    /// the interact debug mode.
    pub fn new(tx: TransportSender, ctx: Rc<Context>, init_received: bool) -> Router {
        let (reaper_tx, reaper_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Router {
            tx,
            ctx,
            channels: HashMap::new(),
            recently_closed: VecDeque::new(),
            rules: Rc::new(std::cell::RefCell::new(RuleSet::default())),
            superuser: false,
            init_received,
            bridges: HashMap::new(),
            last_privileged: None,
            reaper_tx,
            reaper_rx,
            events_tx,
            events_rx,
        }
    }

    /// Install the rules extracted from package manifests.
    pub fn set_rules(&self, values: &[Value]) {
        self.rules_handle().set(values);
    }

    /// A handle for updating the rules while the router runs.
    pub fn rules_handle(&self) -> RulesHandle {
        RulesHandle {
            set: self.rules.clone(),
        }
    }

    /// The rules in match order, for `--rules`.
    pub fn dump_rules(&self) -> Vec<Value> {
        let set = self.rules.borrow();
        set.rules
            .iter()
            .chain(set.late.iter())
            .map(Rule::to_value)
            .collect()
    }

    /// Drive the router until the transport ends. The error, if any,
    /// is the problem the transport must be closed with.
    pub async fn run<R>(&mut self, transport: &mut Transport<R>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            tokio::select! {
                frame = transport.recv() => match frame {
                    Ok(Some(frame)) => self.handle_frame(frame).await?,
                    Ok(None) => {
                        self.shutdown().await;
                        return Ok(());
                    }
                    Err(err) => {
                        self.shutdown().await;
                        return Err(err);
                    }
                },
                Some(id) = self.reaper_rx.recv() => self.reap(id),
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Control(payload) => self.handle_control(payload).await,
            Frame::Data(channel, payload) => self.handle_data(channel, payload).await,
        }
    }

    async fn handle_data(&mut self, channel: String, payload: Bytes) -> Result<()> {
        if !self.init_received {
            warn!("caller sent data without an init message");
            return Err(Error::new_protocol());
        }

        enum Route {
            Local(mpsc::Sender<ChannelCtl>),
            Bridge(TransportSender),
            Unknown,
        }

        let route = match self.channels.get(&channel) {
            Some(Entry::Local { ctl, .. }) if !ctl.is_closed() => Route::Local(ctl.clone()),
            Some(Entry::Local { .. }) => Route::Unknown,
            Some(Entry::Bridged { key, .. }) => match self.bridges.get(key) {
                Some(bridge) => Route::Bridge(bridge.tx.clone()),
                None => Route::Unknown,
            },
            None => Route::Unknown,
        };

        match route {
            Route::Local(ctl) => {
                if ctl.send(ChannelCtl::Recv(payload)).await.is_err() {
                    debug!("{}: channel went away mid-frame", channel);
                }
            }
            Route::Bridge(tx) => {
                let _ = tx.send(Some(&channel), payload).await;
            }
            Route::Unknown => {
                if self.recently_closed.contains(&channel) {
                    debug!("dropping frame for closed channel {}", channel);
                } else {
                    warn!("dropping frame for unknown channel {}", channel);
                }
            }
        }

        Ok(())
    }

    async fn handle_control(&mut self, payload: Bytes) -> Result<()> {
        let message = protocol::parse_control(&payload)?;

        if !self.init_received {
            if message.command != "init" {
                warn!(
                    "caller sent \"{}\" before the init message",
                    message.command
                );
                return Err(Error::new_protocol());
            }
            return self.handle_init(message);
        }

        match message.command.as_str() {
            "init" => {
                debug!("caller sent init again");
                Ok(())
            }
            "open" => self.handle_open(message).await,
            "close" => self.handle_close(message).await,
            "kill" => self.handle_kill(message).await,
            "ping" => self.tx.control(&protocol::pong(&message.options)).await,
            "pong" => Ok(()),
            "authorize" => {
                // Credentials for a pending superuser escalation.
                let bridge = self
                    .last_privileged
                    .as_ref()
                    .and_then(|key| self.bridges.get(key));
                match bridge {
                    Some(bridge) => bridge.tx.control(&message.options).await,
                    None => {
                        debug!("dropping authorize message with no privileged bridge");
                        Ok(())
                    }
                }
            }
            _ => self.forward_to_channel(message).await,
        }
    }

    fn handle_init(&mut self, message: ControlMessage) -> Result<()> {
        match opt::get_int(&message.options, "version") {
            Ok(Some(protocol::VERSION)) => {}
            Ok(_) => {
                warn!("peer offered an unsupported protocol version");
                return Err(Error::new_not_supported());
            }
            Err(err) => return Err(err),
        }

        if !matches!(message.options.get("superuser"), None | Some(Value::Null)) {
            self.superuser = true;
        }

        self.init_received = true;
        Ok(())
    }

    async fn handle_open(&mut self, message: ControlMessage) -> Result<()> {
        let id = match message.channel {
            Some(id) => id,
            None => {
                warn!("caller sent open without a channel");
                return Err(Error::new_protocol());
            }
        };

        // A finished channel may not have been reaped yet; don't let
        // that block the id from being reused.
        if matches!(self.channels.get(&id), Some(Entry::Local { ctl, .. }) if ctl.is_closed()) {
            self.channels.remove(&id);
            self.push_closed(id.clone());
        }

        if self.channels.contains_key(&id) {
            warn!("{}: caller tried to reuse an open channel", id);
            self.close_channel(&id, Some("protocol-error")).await?;
            return Ok(());
        }

        let options = message.options;

        let payload = match opt::get_str(&options, "payload") {
            Ok(Some(payload)) => payload.to_string(),
            _ => {
                warn!("{}: caller opened channel with bad payload", id);
                self.close_channel(&id, Some("protocol-error")).await?;
                return Ok(());
            }
        };
        let host = opt::get_str(&options, "host")
            .unwrap_or(None)
            .map(str::to_owned);
        let group = opt::get_str(&options, "group")
            .unwrap_or(None)
            .map(str::to_owned);

        let rule = {
            let set = self.rules.borrow();
            set.rules
                .iter()
                .find(|rule| rule.matches(&options))
                .or_else(|| {
                    if self.superuser {
                        set.late.iter().find(|rule| rule.matches(&options))
                    } else {
                        None
                    }
                })
                .cloned()
        };

        if let Some(rule) = rule {
            return self.dispatch_rule(rule, id, options, host, group).await;
        }

        match channel::lookup(&payload) {
            Some(constructor) => {
                let (ctl_tx, ctl_rx) = mpsc::channel(32);
                let io = ChannelIo::new(
                    id.clone(),
                    options,
                    self.tx.clone(),
                    ctl_rx,
                    self.reaper_tx.clone(),
                );
                self.channels.insert(
                    id,
                    Entry::Local {
                        ctl: ctl_tx,
                        host,
                        group,
                    },
                );
                tokio::task::spawn_local(constructor(io, self.ctx.clone()));
                Ok(())
            }
            None => {
                debug!("{}: caller opened unknown payload: {}", id, payload);
                self.close_channel(&id, Some("not-supported")).await
            }
        }
    }

    async fn dispatch_rule(
        &mut self,
        rule: Rule,
        id: String,
        options: Value,
        host: Option<String>,
        group: Option<String>,
    ) -> Result<()> {
        if let Some(ref problem) = rule.problem {
            return self.close_channel(&id, Some(problem.as_str())).await;
        }

        let spawn = rule.spawn.clone().expect("rule without problem spawns");
        let key = spawn.join("\u{1f}");

        if !self.bridges.contains_key(&key) {
            match Bridge::spawn(&rule, key.clone(), self.tx.clone(), self.events_tx.clone()).await
            {
                Ok(bridge) => {
                    if bridge.privileged {
                        self.last_privileged = Some(key.clone());
                    }
                    self.bridges.insert(key.clone(), bridge);
                }
                Err(err) => {
                    warn!("couldn't start bridge {}: {}", spawn[0], err);
                    return self.close_channel(&id, Some(err.problem())).await;
                }
            }
        }

        let bridge = self.bridges.get(&key).expect("bridge just ensured");
        bridge.channels.borrow_mut().insert(id.clone());
        let tx = bridge.tx.clone();

        if tx.control(&options).await.is_err() {
            debug!("bridge went away before open could be forwarded");
            return self.close_channel(&id, Some("terminated")).await;
        }

        self.channels
            .insert(id, Entry::Bridged { key, host, group });
        Ok(())
    }

    async fn handle_close(&mut self, message: ControlMessage) -> Result<()> {
        let id = match message.channel {
            Some(ref id) => id.clone(),
            None => {
                warn!("caller sent close without a channel");
                return Ok(());
            }
        };

        match self.channels.get(&id) {
            Some(Entry::Local { ctl, .. }) => {
                let ctl = ctl.clone();
                let _ = ctl
                    .send(ChannelCtl::Close {
                        problem: None,
                        reply: false,
                    })
                    .await;
            }
            Some(Entry::Bridged { key, .. }) => {
                let key = key.clone();
                if let Some(bridge) = self.bridges.get(&key) {
                    bridge.channels.borrow_mut().remove(&id);
                    let _ = bridge.tx.control(&message.options).await;
                }
                self.channels.remove(&id);
                self.push_closed(id);
                self.maybe_release_bridge(&key);
            }
            None => {
                debug!("{}: caller closed unknown channel", id);
            }
        }

        Ok(())
    }

    async fn handle_kill(&mut self, message: ControlMessage) -> Result<()> {
        let host = opt::get_str(&message.options, "host").unwrap_or(None);
        let group = opt::get_str(&message.options, "group").unwrap_or(None);

        let ids: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, entry)| {
                host.map_or(true, |host| entry.host() == Some(host))
                    && group.map_or(true, |group| entry.group() == Some(group))
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in ids {
            debug!("{}: killing channel", id);
            match self.channels.get(&id) {
                Some(Entry::Local { ctl, .. }) => {
                    let ctl = ctl.clone();
                    let _ = ctl
                        .send(ChannelCtl::Close {
                            problem: Some("terminated".to_string()),
                            reply: true,
                        })
                        .await;
                }
                Some(Entry::Bridged { key, .. }) => {
                    let key = key.clone();
                    if let Some(bridge) = self.bridges.get(&key) {
                        bridge.channels.borrow_mut().remove(&id);
                        let _ = bridge
                            .tx
                            .control(&protocol::close(&id, Some("terminated")))
                            .await;
                    }
                    self.tx
                        .control(&protocol::close(&id, Some("terminated")))
                        .await?;
                    self.channels.remove(&id);
                    self.push_closed(id);
                    self.maybe_release_bridge(&key);
                }
                None => {}
            }
        }

        Ok(())
    }

    /// Other channel-addressed control messages (`done`, `options`, …)
    /// go to the channel implementation or its bridge.
    async fn forward_to_channel(&mut self, message: ControlMessage) -> Result<()> {
        let id = match message.channel {
            Some(ref id) => id.clone(),
            None => {
                warn!("caller sent unknown control: {}", message.command);
                return Ok(());
            }
        };

        match self.channels.get(&id) {
            Some(Entry::Local { ctl, .. }) => {
                let ctl = ctl.clone();
                let input = if message.command == "done" {
                    ChannelCtl::Done
                } else {
                    ChannelCtl::Control(message)
                };
                if ctl.send(input).await.is_err() {
                    debug!("{}: channel went away mid-control", id);
                }
            }
            Some(Entry::Bridged { key, .. }) => {
                if let Some(bridge) = self.bridges.get(key) {
                    let _ = bridge.tx.control(&message.options).await;
                }
            }
            None => {
                debug!("{}: control for unknown channel: {}", id, message.command);
            }
        }

        Ok(())
    }

    async fn handle_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::BridgeChannelClosed(key, channel) => {
                if matches!(self.channels.get(&channel), Some(Entry::Bridged { key: k, .. }) if *k == key)
                {
                    self.channels.remove(&channel);
                    self.push_closed(channel);
                }
                self.maybe_release_bridge(&key);
            }
            RouterEvent::BridgeExited(key) => {
                if let Some(mut bridge) = self.bridges.remove(&key) {
                    let ids: Vec<String> = bridge.channels.borrow().iter().cloned().collect();
                    for id in ids {
                        let _ = self
                            .tx
                            .control(&protocol::close(&id, Some("terminated")))
                            .await;
                        self.channels.remove(&id);
                        self.push_closed(id);
                    }
                    bridge.terminate();
                }
                if self.last_privileged.as_deref() == Some(key.as_str()) {
                    self.last_privileged = None;
                }
            }
        }
    }

    fn maybe_release_bridge(&mut self, key: &str) {
        let empty = self
            .bridges
            .get(key)
            .map(|bridge| bridge.channels.borrow().is_empty())
            .unwrap_or(false);
        if empty {
            if let Some(mut bridge) = self.bridges.remove(key) {
                bridge.terminate();
            }
            if self.last_privileged.as_deref() == Some(key) {
                self.last_privileged = None;
            }
        }
    }

    fn reap(&mut self, id: String) {
        if matches!(self.channels.get(&id), Some(Entry::Local { ctl, .. }) if ctl.is_closed()) {
            self.channels.remove(&id);
        }
        self.push_closed(id);
    }

    fn push_closed(&mut self, id: String) {
        if self.recently_closed.len() >= CLOSED_RING {
            self.recently_closed.pop_front();
        }
        self.recently_closed.push_back(id);
    }

    async fn close_channel(&self, id: &str, problem: Option<&str>) -> Result<()> {
        self.tx.control(&protocol::close(id, problem)).await
    }

    /// Tear down every channel and bridge; the transport is going away.
    pub async fn shutdown(&mut self) {
        for (_, entry) in self.channels.drain() {
            if let Entry::Local { ctl, .. } = entry {
                let _ = ctl.try_send(ChannelCtl::Close {
                    problem: None,
                    reply: false,
                });
            }
        }
        for (_, mut bridge) in self.bridges.drain() {
            bridge.terminate();
        }
    }
}
