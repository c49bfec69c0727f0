//! Comm (widget) channel registry.
//!
//! Comms are out-of-band, bidirectional sub-channels identified by a
//! `comm_id`. The kernel opens one with `comm_open` naming a target; the
//! registry looks up the factory registered for that target and keeps the
//! resulting handler until `comm_close`. Messages sent on a comm are
//! fire-and-forget.
//!
//! Each comm also keeps a state snapshot, merged from `method: "update"`
//! messages the way ipywidgets syncs model state, exposed in creation order
//! so dependent models can be rebuilt in a valid order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use bytes::Bytes;
use jupyter_wire::{CommClose, CommMsg, CommOpen, Message, MessageContent};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{KernelError, Result};

/// Receives traffic for one comm.
pub trait CommHandler: Send {
    fn on_msg(&mut self, comm: &Comm, data: &Map<String, Value>, buffers: &[Bytes]);

    /// Called when the kernel closes the comm.
    fn on_close(&mut self, _comm: &Comm, _data: &Map<String, Value>) {}
}

/// Builds a handler for a kernel-opened comm.
pub type CommFactory = dyn Fn(&Comm, &CommOpen) -> Box<dyn CommHandler> + Send + Sync;

/// Sends comm traffic on the kernel's shell channel.
pub(crate) type CommSender = Arc<dyn Fn(MessageContent, Vec<Bytes>) -> Result<()> + Send + Sync>;

/// Handle for one open comm.
#[derive(Clone)]
pub struct Comm {
    comm_id: String,
    target_name: String,
    sender: Option<CommSender>,
    registry: Weak<StdMutex<RegistryState>>,
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comm")
            .field("comm_id", &self.comm_id)
            .field("target_name", &self.target_name)
            .finish()
    }
}

impl Comm {
    pub fn comm_id(&self) -> &str {
        &self.comm_id
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Send a `comm_msg`. No reply is expected.
    pub fn send(&self, data: Map<String, Value>, buffers: Vec<Bytes>) -> Result<()> {
        let content = CommMsg {
            comm_id: self.comm_id.clone(),
            data,
        };
        self.transmit(content.into(), buffers)
    }

    /// Send `comm_close` and forget the comm locally.
    pub fn close(&self, data: Map<String, Value>) -> Result<()> {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).comms.remove(&self.comm_id);
        }
        let content = CommClose {
            comm_id: self.comm_id.clone(),
            data,
        };
        self.transmit(content.into(), Vec::new())
    }

    fn transmit(&self, content: MessageContent, buffers: Vec<Bytes>) -> Result<()> {
        match &self.sender {
            Some(sender) => sender(content, buffers),
            None => Err(KernelError::NotConnected),
        }
    }
}

/// A comm's model state, merged from all updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommSnapshot {
    pub comm_id: String,

    /// Target name (e.g., "jupyter.widget").
    pub target_name: String,

    pub state: Value,

    /// `_model_module` from the state, e.g. "@jupyter-widgets/controls".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_module: Option<String>,

    /// `_model_name` from the state, e.g. "IntSliderModel".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<Vec<u8>>,
}

impl CommSnapshot {
    fn from_open(open: &CommOpen, buffers: &[Bytes]) -> Self {
        let state = open
            .data
            .get("state")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let mut snapshot = Self {
            comm_id: open.comm_id.clone(),
            target_name: open.target_name.clone(),
            state,
            model_module: None,
            model_name: None,
            buffers: buffers.iter().map(|b| b.to_vec()).collect(),
        };
        snapshot.refresh_model_info();
        snapshot
    }

    /// Apply the `state` delta of an `update` message, keeping other keys.
    fn merge_update(&mut self, data: &Map<String, Value>, buffers: &[Bytes]) {
        if data.get("method").and_then(Value::as_str) != Some("update") {
            return;
        }
        if let (Some(existing), Some(delta)) = (
            self.state.as_object_mut(),
            data.get("state").and_then(Value::as_object),
        ) {
            for (key, value) in delta {
                existing.insert(key.clone(), value.clone());
            }
        }
        if !buffers.is_empty() {
            self.buffers = buffers.iter().map(|b| b.to_vec()).collect();
        }
        self.refresh_model_info();
    }

    fn refresh_model_info(&mut self) {
        let field = |name: &str| {
            self.state
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        self.model_module = field("_model_module");
        self.model_name = field("_model_name");
    }
}

type SharedHandler = Arc<StdMutex<Box<dyn CommHandler>>>;

struct CommEntry {
    comm: Comm,
    handler: SharedHandler,
    snapshot: CommSnapshot,
    seq: u64,
}

#[derive(Default)]
struct RegistryState {
    targets: HashMap<String, Arc<CommFactory>>,
    comms: HashMap<String, CommEntry>,
    next_seq: u64,
    sender: Option<CommSender>,
}

/// Registry of comm targets and open comms for one kernel connection.
#[derive(Clone, Default)]
pub struct CommRegistry {
    state: Arc<StdMutex<RegistryState>>,
}

fn lock(state: &StdMutex<RegistryState>) -> MutexGuard<'_, RegistryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_handler(handler: &SharedHandler) -> MutexGuard<'_, Box<dyn CommHandler>> {
    handler.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CommRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for comms the kernel opens with `target_name`.
    /// Replaces any previous factory for that target.
    pub fn register_target(
        &self,
        target_name: &str,
        factory: impl Fn(&Comm, &CommOpen) -> Box<dyn CommHandler> + Send + Sync + 'static,
    ) {
        lock(&self.state)
            .targets
            .insert(target_name.to_string(), Arc::new(factory));
    }

    pub fn unregister_target(&self, target_name: &str) -> bool {
        lock(&self.state).targets.remove(target_name).is_some()
    }

    pub fn has_target(&self, target_name: &str) -> bool {
        lock(&self.state).targets.contains_key(target_name)
    }

    /// Open a comm from this side and announce it to the kernel.
    pub fn open_comm(
        &self,
        target_name: &str,
        data: Map<String, Value>,
        handler: Box<dyn CommHandler>,
    ) -> Result<Comm> {
        let open = CommOpen {
            comm_id: uuid::Uuid::new_v4().to_string(),
            target_name: target_name.to_string(),
            data,
            target_module: None,
        };
        let comm = self.make_comm(&open.comm_id, target_name);
        if comm.sender.is_none() {
            return Err(KernelError::NotConnected);
        }
        self.insert(comm.clone(), handler, CommSnapshot::from_open(&open, &[]));
        comm.transmit(open.into(), Vec::new())?;
        Ok(comm)
    }

    pub fn comm(&self, comm_id: &str) -> Option<Comm> {
        lock(&self.state).comms.get(comm_id).map(|e| e.comm.clone())
    }

    /// Snapshots of every open comm, in creation order.
    pub fn snapshots(&self) -> Vec<CommSnapshot> {
        let state = lock(&self.state);
        let mut entries: Vec<_> = state.comms.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.snapshot.clone()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).comms.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).comms.is_empty()
    }

    /// Forget every open comm. Targets stay registered.
    ///
    /// Called when the kernel restarts or shuts down, as all comms become
    /// invalid.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        if !state.comms.is_empty() {
            info!("[comm] Clearing {} comms", state.comms.len());
        }
        state.comms.clear();
        state.next_seq = 0;
    }

    pub(crate) fn attach(&self, sender: CommSender) {
        lock(&self.state).sender = Some(sender);
    }

    pub(crate) fn detach(&self) {
        lock(&self.state).sender = None;
    }

    /// Dispatch a `comm_open`, `comm_msg` or `comm_close` from the kernel.
    pub(crate) fn route(&self, message: &Message) {
        match &message.content {
            MessageContent::CommOpen(open) => self.handle_open(open, &message.buffers),
            MessageContent::CommMsg(msg) => self.handle_msg(msg, &message.buffers),
            MessageContent::CommClose(close) => self.handle_close(close),
            other => debug!("[comm] Not a comm message: {}", other.msg_type()),
        }
    }

    fn handle_open(&self, open: &CommOpen, buffers: &[Bytes]) {
        let factory = lock(&self.state).targets.get(&open.target_name).cloned();
        let Some(factory) = factory else {
            warn!(
                "[comm] No target '{}' registered; dropping comm_open {}",
                open.target_name, open.comm_id
            );
            return;
        };

        let comm = self.make_comm(&open.comm_id, &open.target_name);
        let handler = factory(&comm, open);
        debug!("[comm] Opened {} ({})", open.comm_id, open.target_name);
        self.insert(comm, handler, CommSnapshot::from_open(open, buffers));
    }

    fn handle_msg(&self, msg: &CommMsg, buffers: &[Bytes]) {
        let target = {
            let mut state = lock(&self.state);
            state.comms.get_mut(&msg.comm_id).map(|entry| {
                entry.snapshot.merge_update(&msg.data, buffers);
                (entry.comm.clone(), entry.handler.clone())
            })
        };
        match target {
            Some((comm, handler)) => lock_handler(&handler).on_msg(&comm, &msg.data, buffers),
            None => debug!("[comm] comm_msg for unknown comm {}", msg.comm_id),
        }
    }

    fn handle_close(&self, close: &CommClose) {
        let entry = lock(&self.state).comms.remove(&close.comm_id);
        match entry {
            Some(entry) => {
                debug!("[comm] Closed {}", close.comm_id);
                lock_handler(&entry.handler).on_close(&entry.comm, &close.data);
            }
            None => debug!("[comm] comm_close for unknown comm {}", close.comm_id),
        }
    }

    fn make_comm(&self, comm_id: &str, target_name: &str) -> Comm {
        Comm {
            comm_id: comm_id.to_string(),
            target_name: target_name.to_string(),
            sender: lock(&self.state).sender.clone(),
            registry: Arc::downgrade(&self.state),
        }
    }

    fn insert(&self, comm: Comm, handler: Box<dyn CommHandler>, snapshot: CommSnapshot) {
        let mut state = lock(&self.state);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.comms.insert(
            comm.comm_id.clone(),
            CommEntry {
                comm,
                handler: Arc::new(StdMutex::new(handler)),
                snapshot,
                seq,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jupyter_wire::Channel;
    use serde_json::json;

    #[derive(Default, Clone)]
    struct Recorder {
        events: Arc<StdMutex<Vec<String>>>,
    }

    impl CommHandler for Recorder {
        fn on_msg(&mut self, comm: &Comm, data: &Map<String, Value>, _buffers: &[Bytes]) {
            self.events
                .lock()
                .unwrap()
                .push(format!("msg {} {}", comm.comm_id(), Value::Object(data.clone())));
        }

        fn on_close(&mut self, comm: &Comm, _data: &Map<String, Value>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("close {}", comm.comm_id()));
        }
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn iopub(content: impl Into<MessageContent>) -> Message {
        Message::new(content, "kernel-session").with_channel(Channel::Iopub)
    }

    fn open_msg(comm_id: &str, target: &str, data: Value) -> Message {
        iopub(CommOpen {
            comm_id: comm_id.into(),
            target_name: target.into(),
            data: object(data),
            target_module: None,
        })
    }

    fn update_msg(comm_id: &str, delta: Value) -> Message {
        iopub(CommMsg {
            comm_id: comm_id.into(),
            data: object(json!({"method": "update", "state": delta})),
        })
    }

    fn registry_with_recorder() -> (CommRegistry, Recorder) {
        let registry = CommRegistry::new();
        let recorder = Recorder::default();
        let factory_recorder = recorder.clone();
        registry.register_target("jupyter.widget", move |_, _| {
            Box::new(factory_recorder.clone())
        });
        (registry, recorder)
    }

    fn capture_sent(registry: &CommRegistry) -> Arc<StdMutex<Vec<MessageContent>>> {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sink = sent.clone();
        registry.attach(Arc::new(move |content, _buffers| {
            sink.lock().unwrap().push(content);
            Ok(())
        }));
        sent
    }

    #[test]
    fn test_comm_open_creates_entry() {
        let (registry, _) = registry_with_recorder();
        registry.route(&open_msg(
            "comm-1",
            "jupyter.widget",
            json!({"state": {
                "_model_name": "IntSliderModel",
                "_model_module": "@jupyter-widgets/controls",
                "value": 50
            }}),
        ));

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].comm_id, "comm-1");
        assert_eq!(snapshots[0].model_name.as_deref(), Some("IntSliderModel"));
        assert_eq!(
            snapshots[0].model_module.as_deref(),
            Some("@jupyter-widgets/controls")
        );
        assert_eq!(snapshots[0].state["value"], 50);
        assert!(registry.comm("comm-1").is_some());
    }

    #[test]
    fn test_unknown_target_is_dropped() {
        let (registry, _) = registry_with_recorder();
        registry.route(&open_msg("comm-1", "unregistered", json!({})));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_update_merges_state_and_reaches_handler() {
        let (registry, recorder) = registry_with_recorder();
        registry.route(&open_msg(
            "comm-1",
            "jupyter.widget",
            json!({"state": {"value": 0, "min": 0, "max": 100}}),
        ));
        registry.route(&update_msg("comm-1", json!({"value": 50})));

        let snapshot = &registry.snapshots()[0];
        assert_eq!(snapshot.state["value"], 50);
        assert_eq!(snapshot.state["min"], 0);
        assert_eq!(snapshot.state["max"], 100);
        assert_eq!(recorder.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_custom_message_does_not_touch_state() {
        let (registry, recorder) = registry_with_recorder();
        registry.route(&open_msg("comm-1", "jupyter.widget", json!({"state": {"value": 1}})));
        registry.route(&iopub(CommMsg {
            comm_id: "comm-1".into(),
            data: object(json!({"method": "custom", "content": {"event": "click"}})),
        }));

        assert_eq!(registry.snapshots()[0].state["value"], 1);
        assert_eq!(recorder.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_message_for_unknown_comm_is_ignored() {
        let (registry, recorder) = registry_with_recorder();
        registry.route(&update_msg("nonexistent", json!({"value": 42})));
        assert!(registry.is_empty());
        assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_kernel_close_removes_and_notifies() {
        let (registry, recorder) = registry_with_recorder();
        registry.route(&open_msg("comm-1", "jupyter.widget", json!({})));
        registry.route(&iopub(CommClose {
            comm_id: "comm-1".into(),
            data: Map::new(),
        }));

        assert!(registry.is_empty());
        assert_eq!(*recorder.events.lock().unwrap(), vec!["close comm-1"]);
    }

    #[test]
    fn test_snapshots_in_creation_order() {
        let (registry, _) = registry_with_recorder();
        for i in 0..10 {
            registry.route(&open_msg(
                &format!("comm-{}", i),
                "jupyter.widget",
                json!({"state": {"index": i}}),
            ));
        }

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 10);
        for (i, snapshot) in snapshots.iter().enumerate() {
            assert_eq!(snapshot.comm_id, format!("comm-{}", i));
        }
    }

    #[test]
    fn test_buffers_are_stored() {
        let (registry, _) = registry_with_recorder();
        let message = open_msg("comm-1", "jupyter.widget", json!({"state": {}}))
            .with_buffers(vec![Bytes::from_static(&[1, 2, 3])]);
        registry.route(&message);
        assert_eq!(registry.snapshots()[0].buffers, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_clear_keeps_targets() {
        let (registry, _) = registry_with_recorder();
        registry.route(&open_msg("comm-1", "jupyter.widget", json!({})));
        registry.route(&open_msg("comm-2", "jupyter.widget", json!({})));
        registry.clear();

        assert!(registry.is_empty());
        assert!(registry.has_target("jupyter.widget"));
        assert!(registry.unregister_target("jupyter.widget"));
        assert!(!registry.has_target("jupyter.widget"));
    }

    #[test]
    fn test_open_comm_requires_connection() {
        let registry = CommRegistry::new();
        let result = registry.open_comm("echo", Map::new(), Box::new(Recorder::default()));
        assert!(matches!(result, Err(KernelError::NotConnected)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_client_comm_send_and_close() {
        let registry = CommRegistry::new();
        let sent = capture_sent(&registry);

        let comm = registry
            .open_comm("echo", object(json!({"hello": 1})), Box::new(Recorder::default()))
            .unwrap();
        comm.send(object(json!({"ping": true})), Vec::new()).unwrap();
        comm.close(Map::new()).unwrap();

        let sent = sent.lock().unwrap();
        let types: Vec<&str> = sent.iter().map(|c| c.msg_type()).collect();
        assert_eq!(types, vec!["comm_open", "comm_msg", "comm_close"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handler_can_reply_on_its_comm() {
        struct Echo;
        impl CommHandler for Echo {
            fn on_msg(&mut self, comm: &Comm, data: &Map<String, Value>, _: &[Bytes]) {
                comm.send(data.clone(), Vec::new()).unwrap();
            }
        }

        let registry = CommRegistry::new();
        let sent = capture_sent(&registry);
        registry.register_target("echo", |_, _| Box::new(Echo));
        registry.route(&open_msg("comm-1", "echo", json!({})));
        registry.route(&iopub(CommMsg {
            comm_id: "comm-1".into(),
            data: object(json!({"x": 1})),
        }));

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type(), "comm_msg");
    }
}
