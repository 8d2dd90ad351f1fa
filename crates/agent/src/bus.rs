use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use concord_core::{AgentType, BusConfig, Error, Message, MessagePriority, MessageType, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::directory::AgentDirectory;
use crate::runtime::{cutoff_before, lock};

/// What a handler wants sent back to the requester.
#[derive(Debug, Clone, Default)]
pub struct HandlerReply {
    pub content: Value,
    pub metadata: Map<String, Value>,
}

impl HandlerReply {
    pub fn new(content: Value) -> Self {
        Self { content, metadata: Map::new() }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

pub type HandlerFuture = BoxFuture<'static, Result<Option<HandlerReply>>>;
pub type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// A message to be sent, plus how the sender wants to wait for it.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    from: String,
    to: String,
    message_type: MessageType,
    content: Value,
    metadata: Map<String, Value>,
    priority: MessagePriority,
    requires_response: bool,
    timeout: Option<Duration>,
}

impl OutgoingMessage {
    pub fn new(from: &str, to: &str, message_type: MessageType, content: Value) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            message_type,
            content,
            metadata: Map::new(),
            priority: MessagePriority::Normal,
            requires_response: false,
            timeout: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn expect_response(mut self) -> Self {
        self.requires_response = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn build(self) -> Message {
        Message::new(&self.from, &self.to, self.message_type, self.content)
            .with_priority(self.priority)
            .with_metadata(self.metadata)
            .requiring_response(self.requires_response)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub running: bool,
    pub queued: usize,
    pub pending_responses: usize,
    pub threads: usize,
    pub handlers: usize,
    pub messages_in_threads: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub handler_failures: u64,
}

type ThreadKey = (String, String);

fn thread_key(a: &str, b: &str) -> ThreadKey {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

struct BusShared {
    directory: Arc<AgentDirectory>,
    config: BusConfig,
    handlers: RwLock<HashMap<(String, MessageType), Handler>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    threads: Mutex<HashMap<ThreadKey, Vec<Message>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
    handler_tasks: Mutex<JoinSet<()>>,
}

impl BusShared {
    fn record_thread(&self, msg: &Message) {
        lock(&self.threads)
            .entry(thread_key(&msg.from_agent, &msg.to_agent))
            .or_default()
            .push(msg.clone());
    }

    fn handler_for(&self, agent_id: &str, message_type: MessageType) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(agent_id.to_string(), message_type))
            .cloned()
    }

    /// Routes one message to its target. Never fails; problems are logged.
    fn dispatch(self: &Arc<Self>, msg: Message) {
        if msg.message_type.is_reply() {
            self.record_thread(&msg);
            let waiter = msg
                .in_reply_to
                .as_ref()
                .and_then(|id| lock(&self.pending).remove(id));
            if let Some(waiter) = waiter {
                if let Some(target) = self.directory.handle(&msg.to_agent) {
                    target.receive_message(msg.clone());
                }
                self.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(message_id = %msg.message_id, in_reply_to = ?msg.in_reply_to, "Reply correlated");
                let _ = waiter.send(msg);
                return;
            }
        }

        let Some(target) = self.directory.handle(&msg.to_agent) else {
            warn!(
                message_id = %msg.message_id,
                from = %msg.from_agent,
                to = %msg.to_agent,
                "Target agent not found, dropping message"
            );
            self.dropped.fetch_add(1, Ordering::Relaxed);
            // releases the waiter so the sender sees "no response" right away
            lock(&self.pending).remove(&msg.message_id);
            return;
        };

        target.receive_message(msg.clone());
        self.delivered.fetch_add(1, Ordering::Relaxed);
        debug!(
            message_id = %msg.message_id,
            from = %msg.from_agent,
            to = %msg.to_agent,
            message_type = %msg.message_type,
            "Message delivered"
        );

        match self.handler_for(&msg.to_agent, msg.message_type) {
            Some(handler) => {
                let mut tasks = lock(&self.handler_tasks);
                while tasks.try_join_next().is_some() {}
                tasks.spawn(run_handler(Arc::clone(self), handler, msg));
            }
            None => debug!(to = %msg.to_agent, message_type = %msg.message_type, "No handler registered"),
        }
    }
}

async fn run_handler(shared: Arc<BusShared>, handler: Handler, msg: Message) {
    let invoked = std::panic::catch_unwind(AssertUnwindSafe(|| handler(msg.clone())));
    let result = match invoked {
        Ok(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(r) => r,
            Err(_) => Err(Error::HandlerFailure("handler panicked".to_string())),
        },
        Err(_) => Err(Error::HandlerFailure("handler panicked".to_string())),
    };

    match result {
        Ok(Some(reply)) if msg.requires_response => {
            let response = msg.reply(MessageType::Response, reply.content, reply.metadata);
            shared.dispatch(response);
        }
        Ok(_) => {}
        Err(e) => {
            shared.handler_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                message_id = %msg.message_id,
                agent_id = %msg.to_agent,
                message_type = %msg.message_type,
                error = %e,
                "Message handler failed"
            );
            if msg.requires_response {
                let mut metadata = Map::new();
                metadata.insert("error".to_string(), Value::Bool(true));
                metadata.insert("original_message_id".to_string(), Value::String(msg.message_id.clone()));
                let response = msg.reply(MessageType::Error, json!({ "error": e.to_string() }), metadata);
                shared.dispatch(response);
            }
        }
    }
}

async fn consume(
    shared: Arc<BusShared>,
    mut rx: mpsc::Receiver<Message>,
    token: CancellationToken,
) -> mpsc::Receiver<Message> {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(msg) => shared.dispatch(msg),
                None => break,
            },
        }
    }
    rx
}

#[derive(Default)]
struct Control {
    tx: Option<mpsc::Sender<Message>>,
    token: Option<CancellationToken>,
    consumer: Option<JoinHandle<mpsc::Receiver<Message>>>,
}

/// In-process message bus between registered agents.
///
/// Delivery is FIFO through one bounded queue drained by a single consumer
/// task. Handlers run on their own tasks so a slow handler never stalls the
/// queue; two messages to one agent may therefore be handled concurrently.
/// Request/response pairs are correlated by message id.
pub struct MessageBus {
    shared: Arc<BusShared>,
    control: Mutex<Control>,
}

impl MessageBus {
    pub fn new(directory: Arc<AgentDirectory>, config: BusConfig) -> Self {
        Self {
            shared: Arc::new(BusShared {
                directory,
                config,
                handlers: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                threads: Mutex::new(HashMap::new()),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                handler_failures: AtomicU64::new(0),
                handler_tasks: Mutex::new(JoinSet::new()),
            }),
            control: Mutex::new(Control::default()),
        }
    }

    pub fn directory(&self) -> &Arc<AgentDirectory> {
        &self.shared.directory
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    // ----- lifecycle -----

    /// Starts the consumer task. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut control = lock(&self.control);
        if control.token.is_some() {
            return false;
        }
        let (tx, rx) = mpsc::channel(self.shared.config.queue_capacity.max(1));
        let token = CancellationToken::new();
        control.consumer = Some(tokio::spawn(consume(Arc::clone(&self.shared), rx, token.clone())));
        control.tx = Some(tx);
        control.token = Some(token);
        info!(capacity = self.shared.config.queue_capacity, "Message bus started");
        true
    }

    /// Stops accepting sends, lets the current delivery finish, and discards
    /// whatever is still queued. Running handlers get up to the request
    /// timeout to finish before they are aborted. Returns false if not running.
    pub async fn stop(&self) -> bool {
        let (token, consumer) = {
            let mut control = lock(&self.control);
            let Some(token) = control.token.take() else {
                return false;
            };
            control.tx = None;
            (token, control.consumer.take())
        };

        token.cancel();
        let mut discarded = 0usize;
        if let Some(handle) = consumer {
            match handle.await {
                Ok(mut rx) => {
                    rx.close();
                    while let Ok(msg) = rx.try_recv() {
                        lock(&self.shared.pending).remove(&msg.message_id);
                        discarded += 1;
                    }
                }
                Err(e) => warn!(error = %e, "Bus consumer task ended abnormally"),
            }
        }
        let aborted = self.drain_handlers(self.shared.config.request_timeout()).await;
        info!(discarded, aborted, "Message bus stopped");
        true
    }

    /// Waits for in-flight handlers, including any replies they dispatch.
    /// Returns how many were still running at the deadline and got aborted.
    async fn drain_handlers(&self, limit: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let mut tasks = std::mem::take(&mut *lock(&self.shared.handler_tasks));
            if tasks.is_empty() {
                return 0;
            }
            let drained = tokio::time::timeout_at(deadline, async {
                while let Some(joined) = tasks.join_next().await {
                    if let Err(e) = joined {
                        warn!(error = %e, "Handler task ended abnormally");
                    }
                }
            })
            .await;
            if drained.is_err() {
                let aborted = tasks.len();
                tasks.abort_all();
                warn!(aborted, "Handlers still running at shutdown, aborting");
                return aborted;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.control).token.is_some()
    }

    fn sender(&self) -> Result<mpsc::Sender<Message>> {
        lock(&self.control).tx.clone().ok_or(Error::BusStopped)
    }

    // ----- handlers -----

    /// Registers the handler for `(agent_id, message_type)`, replacing any previous one.
    pub fn register_handler<F, Fut>(&self, agent_id: &str, message_type: MessageType, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<HandlerReply>>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |msg| handler(msg).boxed());
        self.shared
            .handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert((agent_id.to_string(), message_type), handler);
        debug!(agent_id = %agent_id, message_type = %message_type, "Handler registered");
    }

    pub fn unregister_handler(&self, agent_id: &str, message_type: MessageType) -> bool {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(agent_id.to_string(), message_type))
            .is_some()
    }

    pub fn unregister_agent_handlers(&self, agent_id: &str) -> usize {
        let mut handlers = self.shared.handlers.write().unwrap_or_else(|p| p.into_inner());
        let before = handlers.len();
        handlers.retain(|(id, _), _| id != agent_id);
        before - handlers.len()
    }

    // ----- sending -----

    /// Enqueues a message. When a response is expected, waits for it up to the
    /// message timeout (the bus request timeout by default). `Ok(None)` means
    /// no response arrived.
    pub async fn send(&self, outgoing: OutgoingMessage) -> Result<Option<Message>> {
        let tx = self.sender()?;
        let timeout = outgoing.timeout.unwrap_or_else(|| self.shared.config.request_timeout());
        let msg = outgoing.build();
        let message_id = msg.message_id.clone();

        if let Some(sender) = self.shared.directory.handle(&msg.from_agent) {
            sender.send_message(msg.clone());
        }
        self.shared.record_thread(&msg);

        let waiter = if msg.requires_response {
            let (reply_tx, reply_rx) = oneshot::channel();
            lock(&self.shared.pending).insert(message_id.clone(), reply_tx);
            Some(reply_rx)
        } else {
            None
        };

        debug!(
            message_id = %message_id,
            from = %msg.from_agent,
            to = %msg.to_agent,
            message_type = %msg.message_type,
            "Message enqueued"
        );
        if tx.send(msg).await.is_err() {
            lock(&self.shared.pending).remove(&message_id);
            return Err(Error::BusStopped);
        }

        let Some(reply_rx) = waiter else {
            return Ok(None);
        };
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => {
                debug!(message_id = %message_id, "Message discarded before a response");
                Ok(None)
            }
            Err(_) => {
                lock(&self.shared.pending).remove(&message_id);
                warn!(message_id = %message_id, timeout_secs = timeout.as_secs_f64(), "Response timeout");
                Ok(None)
            }
        }
    }

    /// Sends an independent copy to every target agent except the sender and
    /// `exclude`. Targets are the agents of `target_types`, or everyone.
    /// Returns how many copies were enqueued.
    pub async fn broadcast(
        &self,
        from: &str,
        message_type: MessageType,
        content: Value,
        target_types: Option<&[AgentType]>,
        exclude: &[&str],
    ) -> Result<usize> {
        let tx = self.sender()?;
        let directory = &self.shared.directory;
        let mut targets: Vec<String> = match target_types {
            Some(types) => types
                .iter()
                .flat_map(|t| directory.by_type(*t))
                .map(|s| s.agent_id)
                .collect(),
            None => directory.ids(),
        };
        let mut seen = std::collections::HashSet::new();
        targets.retain(|id| id != from && !exclude.contains(&id.as_str()) && seen.insert(id.clone()));

        let mut sent = 0;
        for to in targets {
            let msg = Message::new(from, &to, message_type, content.clone());
            self.shared.record_thread(&msg);
            if tx.send(msg).await.is_err() {
                return Err(Error::BusStopped);
            }
            sent += 1;
        }
        info!(from = %from, message_type = %message_type, recipients = sent, "Broadcast sent");
        Ok(sent)
    }

    /// Offers a task to another agent. True only when the target replies with
    /// `handoff_accepted = true` before the handoff timeout.
    pub async fn handoff_task(
        &self,
        from: &str,
        to: &str,
        task_description: &str,
        context: Map<String, Value>,
        original_input: &str,
    ) -> bool {
        let mut metadata = Map::new();
        metadata.insert("handoff_timestamp".to_string(), Value::String(Utc::now().to_rfc3339()));
        let outgoing = OutgoingMessage::new(
            from,
            to,
            MessageType::Handoff,
            json!({
                "task_description": task_description,
                "context": context,
                "original_input": original_input,
            }),
        )
        .with_priority(MessagePriority::High)
        .with_metadata(metadata)
        .expect_response()
        .with_timeout(self.shared.config.handoff_timeout());

        match self.send(outgoing).await {
            Ok(Some(reply)) if reply.metadata_flag("handoff_accepted") => {
                info!(from = %from, to = %to, "Handoff accepted");
                true
            }
            Ok(Some(_)) => {
                warn!(from = %from, to = %to, "Handoff rejected");
                false
            }
            Ok(None) => {
                warn!(from = %from, to = %to, "Handoff got no response");
                false
            }
            Err(e) => {
                warn!(from = %from, to = %to, error = %e, "Handoff could not be sent");
                false
            }
        }
    }

    /// Sends a REQUEST to the preferred agent if it holds `capability`, else to
    /// the first other agent that does.
    pub async fn request_capability(
        &self,
        from: &str,
        capability: &str,
        parameters: Map<String, Value>,
        preferred_agent: Option<&str>,
    ) -> Result<Option<Message>> {
        let directory = &self.shared.directory;
        let target = preferred_agent
            .and_then(|id| directory.get(id))
            .filter(|s| s.has_capability(capability))
            .map(|s| s.agent_id)
            .or_else(|| {
                directory
                    .by_capability(capability)
                    .into_iter()
                    .find(|s| s.agent_id != from)
                    .map(|s| s.agent_id)
            })
            .ok_or_else(|| Error::AgentNotFound(format!("no agent provides '{}'", capability)))?;

        let outgoing = OutgoingMessage::new(
            from,
            &target,
            MessageType::Request,
            json!({ "capability": capability, "parameters": parameters }),
        )
        .expect_response();
        self.send(outgoing).await
    }

    // ----- conversations -----

    /// Messages exchanged between `a` and `b` in either direction, oldest first.
    pub fn conversation(&self, a: &str, b: &str) -> Vec<Message> {
        let mut messages = lock(&self.shared.threads)
            .get(&thread_key(a, b))
            .cloned()
            .unwrap_or_default();
        messages.sort_by(|x, y| x.timestamp.cmp(&y.timestamp));
        messages
    }

    /// Drops thread messages older than `max_age` and empty threads.
    /// Returns how many messages were removed.
    pub fn prune_conversations(&self, max_age: Duration) -> usize {
        let Some(cutoff) = cutoff_before(max_age) else {
            return 0;
        };
        let mut threads = lock(&self.shared.threads);
        let mut removed = 0;
        for messages in threads.values_mut() {
            let before = messages.len();
            messages.retain(|m| m.timestamp > cutoff);
            removed += before - messages.len();
        }
        threads.retain(|_, messages| !messages.is_empty());
        if removed > 0 {
            debug!(removed, "Pruned conversation messages");
        }
        removed
    }

    pub fn stats(&self) -> BusStats {
        let (running, queued) = {
            let control = lock(&self.control);
            let queued = control
                .tx
                .as_ref()
                .map(|tx| tx.max_capacity() - tx.capacity())
                .unwrap_or(0);
            (control.token.is_some(), queued)
        };
        let (threads, messages_in_threads) = {
            let threads = lock(&self.shared.threads);
            (threads.len(), threads.values().map(Vec::len).sum())
        };
        BusStats {
            running,
            queued,
            pending_responses: lock(&self.shared.pending).len(),
            threads,
            handlers: self.shared.handlers.read().unwrap_or_else(|p| p.into_inner()).len(),
            messages_in_threads,
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            handler_failures: self.shared.handler_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tests::{agent, ScriptedLogic};
    use concord_core::Capability;
    use std::sync::atomic::AtomicUsize;

    fn bus_with(ids: &[(&str, AgentType)], config: BusConfig) -> MessageBus {
        let directory = Arc::new(AgentDirectory::default());
        for (id, agent_type) in ids {
            directory.register(agent(id, *agent_type, ScriptedLogic::answering("ok")));
        }
        MessageBus::new(directory, config)
    }

    fn two_agents() -> MessageBus {
        bus_with(&[("a", AgentType::Orchestrator), ("b", AgentType::Productivity)], BusConfig::default())
    }

    async fn failing(_msg: Message) -> Result<Option<HandlerReply>> {
        Err(Error::Other("bad input".to_string()))
    }

    async fn exploding(_msg: Message) -> Result<Option<HandlerReply>> {
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn test_response_is_correlated() {
        let bus = two_agents();
        bus.start();
        bus.register_handler("b", MessageType::Request, |msg: Message| async move {
            Ok(Some(HandlerReply::new(json!(format!("pong:{}", msg.content)))))
        });

        let out = OutgoingMessage::new("a", "b", MessageType::Request, json!("ping")).expect_response();
        let reply = bus.send(out).await.unwrap().unwrap();
        assert_eq!(reply.message_type, MessageType::Response);
        assert_eq!(reply.from_agent, "b");
        assert_eq!(reply.content, json!("pong:\"ping\""));

        let thread = bus.conversation("b", "a");
        assert_eq!(thread.len(), 2);
        assert_eq!(reply.in_reply_to.as_deref(), Some(thread[0].message_id.as_str()));
        assert_eq!(bus.stats().pending_responses, 0);

        let sender = bus.directory().handle("a").unwrap();
        assert_eq!(sender.history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_handler_times_out() {
        let bus = two_agents();
        bus.start();
        let started = tokio::time::Instant::now();
        let out = OutgoingMessage::new("a", "b", MessageType::Request, json!("hello")).expect_response();
        assert!(bus.send(out).await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(bus.stats().pending_responses, 0);
        // delivered even though nobody answered
        assert_eq!(bus.directory().handle("b").unwrap().history().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_target_releases_waiter() {
        let bus = two_agents();
        bus.start();
        let started = std::time::Instant::now();
        let out = OutgoingMessage::new("a", "ghost", MessageType::Request, json!("hi"))
            .expect_response()
            .with_timeout(Duration::from_secs(5));
        assert!(bus.send(out).await.unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
        let stats = bus.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.pending_responses, 0);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender_and_excluded() {
        let bus = bus_with(
            &[
                ("a", AgentType::Orchestrator),
                ("b", AgentType::Productivity),
                ("c", AgentType::Health),
                ("d", AgentType::Health),
            ],
            BusConfig::default(),
        );
        bus.start();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
        for id in ["a", "b", "c", "d"] {
            let seen_tx = seen_tx.clone();
            bus.register_handler(id, MessageType::Broadcast, move |msg: Message| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(msg.to_agent);
                    Ok(None)
                }
            });
        }

        let sent = bus
            .broadcast("a", MessageType::Broadcast, json!("hello"), None, &["d"])
            .await
            .unwrap();
        assert_eq!(sent, 2);
        let mut got = vec![seen_rx.recv().await.unwrap(), seen_rx.recv().await.unwrap()];
        got.sort();
        assert_eq!(got, vec!["b".to_string(), "c".to_string()]);

        let sent = bus
            .broadcast("a", MessageType::Broadcast, json!("hi"), Some(&[AgentType::Health]), &[])
            .await
            .unwrap();
        assert_eq!(sent, 2);
        let mut got = vec![seen_rx.recv().await.unwrap(), seen_rx.recv().await.unwrap()];
        got.sort();
        assert_eq!(got, vec!["c".to_string(), "d".to_string()]);

        // a health agent broadcasting to its own type does not reach itself
        let sent = bus
            .broadcast("c", MessageType::Broadcast, json!("peers"), Some(&[AgentType::Health]), &[])
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(seen_rx.recv().await.unwrap(), "d");
        tokio::task::yield_now().await;
        assert!(seen_rx.try_recv().is_err());
        assert!(bus.conversation("c", "c").is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let bus = two_agents();
        bus.start();
        bus.register_handler("b", MessageType::Request, failing);

        let out = OutgoingMessage::new("a", "b", MessageType::Request, json!({})).expect_response();
        let reply = bus.send(out).await.unwrap().unwrap();
        assert_eq!(reply.message_type, MessageType::Error);
        assert!(reply.metadata_flag("error"));
        assert_eq!(
            reply.metadata.get("original_message_id").and_then(Value::as_str),
            reply.in_reply_to.as_deref()
        );
        assert_eq!(bus.stats().handler_failures, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_error_response() {
        let bus = two_agents();
        bus.start();
        bus.register_handler("b", MessageType::Request, exploding);

        let out = OutgoingMessage::new("a", "b", MessageType::Request, json!({})).expect_response();
        let reply = bus.send(out).await.unwrap().unwrap();
        assert_eq!(reply.message_type, MessageType::Error);

        // the consumer keeps running
        bus.register_handler("b", MessageType::Request, |_m: Message| async {
            Ok(Some(HandlerReply::new(json!("fine"))))
        });
        let out = OutgoingMessage::new("a", "b", MessageType::Request, json!({})).expect_response();
        assert_eq!(bus.send(out).await.unwrap().unwrap().content, json!("fine"));
    }

    #[tokio::test]
    async fn test_stop_discards_queue_and_restart_works() {
        let bus = two_agents();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);
        bus.register_handler("b", MessageType::Notification, move |_m: Message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        });

        let early = OutgoingMessage::new("a", "b", MessageType::Notification, json!(0));
        assert!(matches!(bus.send(early).await, Err(Error::BusStopped)));

        assert!(bus.start());
        assert!(!bus.start());
        for i in 0..3 {
            let out = OutgoingMessage::new("a", "b", MessageType::Notification, json!(i));
            bus.send(out).await.unwrap();
        }
        assert_eq!(bus.stats().queued, 3);

        assert!(bus.stop().await);
        assert!(!bus.stop().await);
        assert_eq!(handled.load(Ordering::SeqCst), 0);
        let out = OutgoingMessage::new("a", "b", MessageType::Notification, json!(9));
        assert!(matches!(bus.send(out).await, Err(Error::BusStopped)));

        assert!(bus.start());
        bus.register_handler("b", MessageType::Request, |_m: Message| async {
            Ok(Some(HandlerReply::new(json!("back"))))
        });
        let out = OutgoingMessage::new("a", "b", MessageType::Request, json!({})).expect_response();
        assert_eq!(bus.send(out).await.unwrap().unwrap().content, json!("back"));
        bus.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_running_handlers() {
        let bus = two_agents();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);
        bus.register_handler("b", MessageType::Notification, move |_m: Message| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        });
        bus.start();
        let out = OutgoingMessage::new("a", "b", MessageType::Notification, json!("slow"));
        bus.send(out).await.unwrap();
        while bus.stats().delivered == 0 {
            tokio::task::yield_now().await;
        }

        assert!(bus.stop().await);
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_handlers_past_deadline() {
        let config = BusConfig { request_timeout_secs: 1, ..BusConfig::default() };
        let bus = bus_with(&[("a", AgentType::Orchestrator), ("b", AgentType::Productivity)], config);
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);
        bus.register_handler("b", MessageType::Notification, move |_m: Message| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        });
        bus.start();
        let out = OutgoingMessage::new("a", "b", MessageType::Notification, json!("stuck"));
        bus.send(out).await.unwrap();
        while bus.stats().delivered == 0 {
            tokio::task::yield_now().await;
        }

        let started = tokio::time::Instant::now();
        assert!(bus.stop().await);
        assert!(started.elapsed() < Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handoff_acceptance() {
        let config = BusConfig { handoff_timeout_secs: 1, ..BusConfig::default() };
        let bus = bus_with(
            &[("a", AgentType::Orchestrator), ("b", AgentType::Productivity), ("c", AgentType::Health)],
            config,
        );
        bus.start();
        bus.register_handler("b", MessageType::Handoff, |msg: Message| async move {
            assert_eq!(msg.priority, MessagePriority::High);
            assert!(msg.metadata.contains_key("handoff_timestamp"));
            Ok(Some(HandlerReply::new(json!("on it")).with_metadata("handoff_accepted", json!(true))))
        });
        bus.register_handler("c", MessageType::Handoff, |_m: Message| async {
            Ok(Some(HandlerReply::new(json!("busy"))))
        });

        assert!(bus.handoff_task("a", "b", "plan the week", Map::new(), "plan my week").await);
        assert!(!bus.handoff_task("a", "c", "plan the week", Map::new(), "plan my week").await);
        bus.unregister_handler("b", MessageType::Handoff);
        assert!(!bus.handoff_task("a", "b", "plan the week", Map::new(), "plan my week").await);
    }

    #[tokio::test]
    async fn test_request_capability_routing() {
        let bus = two_agents();
        let b = bus.directory().handle("b").unwrap();
        b.add_capability(Capability::new("task_management", "tasks"));
        bus.start();
        bus.register_handler("b", MessageType::Request, |msg: Message| async move {
            let cap = msg.content["capability"].as_str().unwrap_or_default().to_string();
            Ok(Some(HandlerReply::new(json!({ "handled": cap }))))
        });

        let reply = bus
            .request_capability("a", "task_management", Map::new(), Some("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.content["handled"], json!("task_management"));

        let missing = bus.request_capability("a", "astrology", Map::new(), None).await;
        assert!(matches!(missing, Err(Error::AgentNotFound(_))));
    }

    #[tokio::test]
    async fn test_prune_conversations_and_handler_cleanup() {
        let bus = two_agents();
        bus.start();
        bus.send(OutgoingMessage::new("a", "b", MessageType::Notification, json!(1)))
            .await
            .unwrap();
        assert_eq!(bus.prune_conversations(Duration::from_secs(3600)), 0);
        assert_eq!(bus.prune_conversations(Duration::MAX), 0);
        assert_eq!(bus.prune_conversations(Duration::from_secs(u64::MAX / 2)), 0);
        assert_eq!(bus.stats().messages_in_threads, 1);
        assert_eq!(bus.prune_conversations(Duration::ZERO), 1);
        assert_eq!(bus.stats().threads, 0);

        bus.register_handler("b", MessageType::Request, failing);
        bus.register_handler("b", MessageType::Handoff, failing);
        assert_eq!(bus.unregister_agent_handlers("b"), 2);
        assert_eq!(bus.stats().handlers, 0);
    }
}
