//! Request/reply protocol over one kernel channel.
//!
//! A [`KernelConnection`] registers a [`KernelFuture`] for every request it
//! sends and routes each incoming message by `parent_header.msg_id`:
//!
//! - iopub traffic (and stdin `input_request`) for a pending request is
//!   appended to that request's future
//! - the terminal shell/control reply settles the future and removes it from
//!   the pending map
//! - unsolicited `comm_*` messages go to the [`CommRegistry`]
//! - anything else is logged and dropped
//!
//! Each kernel generation has its own session id. A restart retires the old
//! id so late replies parented to it are discarded as stale.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use jupyter_wire::{
    decode, encode, Channel, CommInfoRequest, CompleteRequest, ExecuteRequest, ExecutionState,
    Header, InputReply, InspectRequest, InterruptRequest, KernelInfoReply, KernelInfoRequest,
    Message, MessageContent, ReplyError, ReplyStatus, ShutdownRequest,
};
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::channel::{self, ChannelEvent, ChannelHandle, CloseReason, Transport};
use crate::comm::CommRegistry;
use crate::config::KernelClientConfig;
use crate::error::{KernelError, Result};
use crate::future::{FutureShared, KernelFuture};
use crate::signal::{Signal, Subscription};
use crate::status::KernelStatus;

/// Retired session ids remembered for stale-reply detection.
const MAX_RETIRED_SESSIONS: usize = 8;

/// Options for [`KernelConnection::request_execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteOptions {
    pub silent: bool,
    pub store_history: bool,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
    pub user_expressions: Map<String, Value>,
    /// Client-side timeout; falls back to the configured request timeout.
    pub timeout: Option<Duration>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            silent: false,
            store_history: true,
            allow_stdin: false,
            stop_on_error: true,
            user_expressions: Map::new(),
            timeout: None,
        }
    }
}

impl ExecuteOptions {
    fn to_request(&self, code: &str) -> ExecuteRequest {
        ExecuteRequest {
            code: code.to_string(),
            silent: self.silent,
            store_history: self.store_history,
            user_expressions: self.user_expressions.clone(),
            allow_stdin: self.allow_stdin,
            stop_on_error: self.stop_on_error,
        }
    }
}

struct PendingEntry {
    future: Weak<FutureShared>,
    /// `msg_type` of the reply that terminates this request.
    reply_type: Option<String>,
    /// Link epoch the request was sent in.
    epoch: u64,
}

struct ConnectionState {
    status: KernelStatus,
    session_id: String,
    retired_sessions: VecDeque<String>,
    generation: u64,
    link_epoch: u64,
    execution_count: u64,
    kernel_info: Option<KernelInfoReply>,
    pending: HashMap<String, PendingEntry>,
    closed: bool,
}

struct ConnectionInner {
    kernel_id: String,
    config: KernelClientConfig,
    channel: ChannelHandle,
    comms: CommRegistry,
    status_changed: Signal<KernelStatus>,
    state: StdMutex<ConnectionState>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.channel.close();
        let pending: Vec<_> = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pending
            .drain()
            .map(|(_, entry)| entry.future)
            .collect();
        fail_all(pending, &KernelError::NotConnected);
        debug!("[kernel-connection] Connection to {} dropped", self.kernel_id);
    }
}

/// Protocol state machine for one live kernel.
#[derive(Clone)]
pub struct KernelConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for KernelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelConnection")
            .field("kernel_id", &self.inner.kernel_id)
            .field("status", &self.status())
            .finish()
    }
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn fail_all(pending: Vec<Weak<FutureShared>>, err: &KernelError) {
    for weak in pending {
        if let Some(shared) = weak.upgrade() {
            KernelFuture::from_shared(shared).settle(Err(err.clone()));
        }
    }
}

impl KernelConnection {
    /// Open the kernel's channel through `transport` and start routing.
    pub async fn connect(
        kernel_id: &str,
        transport: Arc<dyn Transport>,
        config: KernelClientConfig,
        comms: CommRegistry,
    ) -> Result<Self> {
        let (channel, events) = channel::open(transport, config.backoff.clone()).await?;
        info!("[kernel-connection] Connected to kernel {}", kernel_id);
        Ok(Self::from_channel(kernel_id, channel, events, config, comms))
    }

    /// Wrap an already open channel. Must be called inside a tokio runtime.
    pub fn from_channel(
        kernel_id: &str,
        channel: ChannelHandle,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        config: KernelClientConfig,
        comms: CommRegistry,
    ) -> Self {
        let inner = Arc::new(ConnectionInner {
            kernel_id: kernel_id.to_string(),
            config,
            channel,
            comms,
            status_changed: Signal::new(),
            state: StdMutex::new(ConnectionState {
                status: KernelStatus::Unknown,
                session_id: new_session_id(),
                retired_sessions: VecDeque::new(),
                generation: 0,
                link_epoch: 0,
                execution_count: 0,
                kernel_info: None,
                pending: HashMap::new(),
                closed: false,
            }),
        });

        let weak = Arc::downgrade(&inner);
        inner.comms.attach(Arc::new(move |content, buffers| {
            let inner = weak.upgrade().ok_or(KernelError::NotConnected)?;
            KernelConnection { inner }.send_fire_and_forget(content, buffers)
        }));

        tokio::spawn(run_events(Arc::downgrade(&inner), events));
        Self { inner }
    }

    pub fn kernel_id(&self) -> &str {
        &self.inner.kernel_id
    }

    pub fn status(&self) -> KernelStatus {
        self.lock().status
    }

    /// Session id stamped on requests of the current generation.
    pub fn session_id(&self) -> String {
        self.lock().session_id.clone()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Last execution count reported by the kernel.
    pub fn execution_count(&self) -> u64 {
        self.lock().execution_count
    }

    /// Reply to the most recent successful `kernel_info_request`.
    pub fn kernel_info(&self) -> Option<KernelInfoReply> {
        self.lock().kernel_info.clone()
    }

    /// True once the channel is gone for good: closed explicitly or out of
    /// reconnect attempts. A closed connection refuses every request.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Whether new requests can be sent: not closed and the kernel not dead.
    pub fn is_usable(&self) -> bool {
        refusal(&self.lock()).is_ok()
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .pending
            .values()
            .filter(|e| e.future.strong_count() > 0)
            .count()
    }

    pub fn comms(&self) -> &CommRegistry {
        &self.inner.comms
    }

    /// Observe every accepted status change, synchronously and in order.
    pub fn subscribe_status(
        &self,
        listener: impl Fn(&KernelStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.status_changed.subscribe(listener)
    }

    /// Send an `execute_request` on shell. Returns immediately.
    pub fn request_execute(&self, code: &str, options: ExecuteOptions) -> KernelFuture {
        let request = options.to_request(code);
        self.send_request(request.into(), options.timeout)
    }

    pub fn request_complete(&self, code: &str, cursor_pos: usize) -> KernelFuture {
        let request = CompleteRequest {
            code: code.to_string(),
            cursor_pos,
        };
        self.send_request(request.into(), None)
    }

    pub fn request_inspect(&self, code: &str, cursor_pos: usize, detail_level: u8) -> KernelFuture {
        let request = InspectRequest {
            code: code.to_string(),
            cursor_pos,
            detail_level,
        };
        self.send_request(request.into(), None)
    }

    pub fn request_kernel_info(&self) -> KernelFuture {
        self.send_request(KernelInfoRequest {}.into(), None)
    }

    pub fn request_comm_info(&self, target_name: Option<&str>) -> KernelFuture {
        let request = CommInfoRequest {
            target_name: target_name.map(str::to_string),
        };
        self.send_request(request.into(), None)
    }

    /// Ask the kernel to interrupt the running execution (control channel).
    pub fn interrupt(&self) -> KernelFuture {
        info!("[kernel-connection] Sending interrupt_request");
        self.send_request(InterruptRequest {}.into(), None)
    }

    pub fn request_shutdown(&self, restart: bool) -> KernelFuture {
        self.send_request(ShutdownRequest { restart }.into(), None)
    }

    /// Answer an `input_request`. Fire-and-forget on stdin.
    pub fn send_input_reply(&self, request: &Header, value: &str) -> Result<()> {
        let mut message = Message::child_of(
            InputReply {
                value: value.to_string(),
            },
            request,
        );
        {
            let state = self.lock();
            refusal(&state)?;
            message.header.session = state.session_id.clone();
        }
        message.header.username = self.inner.config.username.clone();
        self.transmit(&message)
    }

    /// Start a new generation: fail every pending request with `err`,
    /// retire the session id and mint a new one.
    pub(crate) fn begin_generation(&self, err: KernelError) {
        let (pending, generation) = {
            let mut state = self.lock();
            let pending: Vec<_> = state.pending.drain().map(|(_, e)| e.future).collect();
            let retired = std::mem::replace(&mut state.session_id, new_session_id());
            state.retired_sessions.push_back(retired);
            while state.retired_sessions.len() > MAX_RETIRED_SESSIONS {
                state.retired_sessions.pop_front();
            }
            state.generation += 1;
            state.execution_count = 0;
            state.kernel_info = None;
            (pending, state.generation)
        };

        info!(
            "[kernel-connection] Kernel {} generation {}: failing {} pending requests",
            self.inner.kernel_id,
            generation,
            pending.len()
        );
        self.set_status(KernelStatus::Restarting);
        self.inner.comms.clear();
        fail_all(pending, &err);
    }

    /// The kernel process is gone. Pending requests fail with `KernelDied`
    /// and new ones are refused until a restart.
    pub(crate) fn mark_dead(&self) {
        let pending: Vec<_> = self
            .lock()
            .pending
            .drain()
            .map(|(_, e)| e.future)
            .collect();
        error!("[kernel-connection] Kernel {} died", self.inner.kernel_id);
        self.set_status(KernelStatus::Dead);
        self.inner.comms.clear();
        fail_all(pending, &KernelError::KernelDied);
    }

    /// Close the channel for good and fail pending requests with `err`.
    pub(crate) fn close(&self, err: KernelError) {
        let pending: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            state.pending.drain().map(|(_, e)| e.future).collect()
        };
        self.inner.channel.close();
        self.inner.comms.clear();
        self.inner.comms.detach();
        self.set_status(KernelStatus::Dead);
        fail_all(pending, &err);
    }

    /// Apply a lifecycle change. Invalid transitions are logged and ignored.
    pub(crate) fn set_status(&self, next: KernelStatus) -> bool {
        let previous = {
            let mut state = self.lock();
            let previous = state.status;
            if !previous.can_transition_to(next) {
                if previous != next {
                    debug!(
                        "[kernel-connection] Ignoring status transition {} -> {}",
                        previous, next
                    );
                }
                return false;
            }
            state.status = next;
            previous
        };

        match next {
            KernelStatus::Idle | KernelStatus::Busy => {
                debug!("[kernel-connection] Status {} -> {}", previous, next)
            }
            _ => info!("[kernel-connection] Status {} -> {}", previous, next),
        }
        self.inner.status_changed.emit(&next);
        true
    }

    fn send_request(&self, content: MessageContent, timeout: Option<Duration>) -> KernelFuture {
        let reply_type = content.expected_reply_type();
        let mut state = self.lock();
        let mut message = Message::new(content, &state.session_id);
        message.header.username = self.inner.config.username.clone();
        let msg_id = message.header.msg_id.clone();
        let msg_type = message.header.msg_type.clone();

        if let Err(err) = refusal(&state) {
            drop(state);
            warn!("[kernel-connection] Refusing {}: {}", msg_type, err);
            return KernelFuture::rejected(msg_id, msg_type, err);
        }

        let future = KernelFuture::new(msg_id.clone(), msg_type.clone());
        let epoch = state.link_epoch;
        state.pending.retain(|_, e| e.future.strong_count() > 0);
        state.pending.insert(
            msg_id.clone(),
            PendingEntry {
                future: future.downgrade(),
                reply_type,
                epoch,
            },
        );
        drop(state);
        future.set_detach(self.detach_hook());

        if let Err(err) = self.transmit(&message) {
            warn!("[kernel-connection] Failed to send {}: {}", msg_type, err);
            self.lock().pending.remove(&msg_id);
            future.settle(Err(err));
            return future;
        }
        debug!("[kernel-connection] Sent {} {}", msg_type, msg_id);

        if let Some(timeout) = timeout.or_else(|| self.inner.config.request_timeout()) {
            future.arm_timeout(timeout);
        }
        future
    }

    fn send_fire_and_forget(&self, content: MessageContent, buffers: Vec<Bytes>) -> Result<()> {
        let message = {
            let state = self.lock();
            refusal(&state)?;
            let mut message = Message::new(content, &state.session_id).with_buffers(buffers);
            message.header.username = self.inner.config.username.clone();
            message
        };
        debug!("[kernel-connection] Sent {}", message.msg_type());
        self.transmit(&message)
    }

    fn transmit(&self, message: &Message) -> Result<()> {
        let frame = encode(message)?;
        self.inner.channel.send(frame)
    }

    fn detach_hook(&self) -> crate::future::DetachHook {
        let weak = Arc::downgrade(&self.inner);
        Box::new(move |msg_id| {
            if let Some(inner) = weak.upgrade() {
                inner
                    .state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .pending
                    .remove(msg_id);
            }
        })
    }

    fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Frame(frame) => match decode(&frame) {
                Ok(message) => self.handle_message(message),
                Err(e) => warn!("[kernel-connection] Dropping malformed frame: {}", e),
            },
            ChannelEvent::Disconnected { reason } => self.on_disconnected(&reason),
            ChannelEvent::Reconnected => self.on_reconnected(),
            ChannelEvent::Closed(reason) => self.on_closed(reason),
        }
    }

    fn handle_message(&self, message: Message) {
        let mut state = self.lock();

        if let Some(session) = message.parent_session() {
            if state.retired_sessions.iter().any(|s| s == session) {
                debug!(
                    "[kernel-connection] Dropping stale {} from retired session {}",
                    message.msg_type(),
                    session
                );
                return;
            }
        }

        let lookup = message.parent_msg_id().and_then(|id| {
            state
                .pending
                .get(id)
                .map(|e| (id.to_string(), e.future.clone(), e.reply_type.clone()))
        });

        let mut target = None;
        let mut terminal = false;
        if let Some((parent_id, weak, reply_type)) = lookup {
            terminal = matches!(message.channel, Channel::Shell | Channel::Control)
                && reply_type.as_deref() == Some(message.msg_type());
            match weak.upgrade() {
                Some(shared) => {
                    if terminal {
                        state.pending.remove(&parent_id);
                    }
                    target = Some(shared);
                }
                None => {
                    debug!(
                        "[kernel-connection] Request {} was dropped; discarding {}",
                        parent_id,
                        message.msg_type()
                    );
                    state.pending.remove(&parent_id);
                }
            }
        }

        let mut resynced = false;
        match &message.content {
            MessageContent::ExecuteInput(input) => {
                state.execution_count = input.execution_count;
            }
            MessageContent::ExecuteReply(reply) if reply.status == ReplyStatus::Ok => {
                if let Some(count) = reply.execution_count {
                    state.execution_count = count;
                }
            }
            MessageContent::KernelInfoReply(reply)
                if terminal && target.is_some() && reply.status == ReplyStatus::Ok =>
            {
                state.kernel_info = Some(reply.clone());
                resynced = true;
            }
            _ => {}
        }
        drop(state);

        if let MessageContent::Status(status) = &message.content {
            if message.channel == Channel::Iopub {
                self.apply_execution_state(status.execution_state);
            }
        }
        if resynced {
            self.on_kernel_info();
        }

        let is_comm = matches!(
            message.content,
            MessageContent::CommOpen(_) | MessageContent::CommMsg(_) | MessageContent::CommClose(_)
        ) && message.channel == Channel::Iopub;

        let Some(shared) = target else {
            if is_comm {
                self.inner.comms.route(&message);
            } else {
                debug!(
                    "[kernel-connection] Dropping unmatched {} on {} (parent {:?})",
                    message.msg_type(),
                    message.channel,
                    message.parent_msg_id()
                );
            }
            return;
        };

        let future = KernelFuture::from_shared(shared);
        if is_comm {
            // widgets created by an execution still need registering
            self.inner.comms.route(&message);
        }

        if terminal {
            let outcome = match message.content.reply_status() {
                Some(ReplyStatus::Ok) | None => None,
                Some(status) => {
                    let error = message.content.reply_error().or_else(|| {
                        (status == ReplyStatus::Error)
                            .then(|| published_error(&future))
                            .flatten()
                    });
                    Some(KernelError::from_reply(status, error))
                }
            };
            future.deliver(message.clone());
            match outcome {
                None => future.settle(Ok(message)),
                Some(err) => future.settle(Err(err)),
            };
            return;
        }

        let streams = message.channel == Channel::Iopub
            || (message.channel == Channel::Stdin
                && matches!(message.content, MessageContent::InputRequest(_)));
        if streams {
            future.deliver(message);
        } else {
            debug!(
                "[kernel-connection] Ignoring {} on {} for {}",
                message.msg_type(),
                message.channel,
                future.msg_id()
            );
        }
    }

    fn apply_execution_state(&self, execution_state: ExecutionState) {
        match execution_state {
            ExecutionState::Starting => {
                self.set_status(KernelStatus::Starting);
            }
            ExecutionState::Idle => {
                self.set_status(KernelStatus::Idle);
            }
            ExecutionState::Busy => {
                self.set_status(KernelStatus::Busy);
            }
            ExecutionState::Restarting => {
                if self.status() != KernelStatus::Restarting {
                    warn!(
                        "[kernel-connection] Kernel {} reported restarting",
                        self.inner.kernel_id
                    );
                    self.begin_generation(KernelError::KernelRestarted);
                }
            }
            ExecutionState::Dead => {
                if self.status() != KernelStatus::Dead {
                    self.mark_dead();
                }
            }
            ExecutionState::Terminating | ExecutionState::Unknown => {
                debug!(
                    "[kernel-connection] Ignoring execution state {:?}",
                    execution_state
                );
            }
        }
    }

    /// A `kernel_info_reply` proves the kernel is up and ready.
    fn on_kernel_info(&self) {
        let status = self.status();
        if matches!(
            status,
            KernelStatus::Unknown
                | KernelStatus::Starting
                | KernelStatus::Restarting
                | KernelStatus::Connected
        ) {
            self.set_status(KernelStatus::Idle);
        }
    }

    fn on_disconnected(&self, reason: &str) {
        let epoch = {
            let mut state = self.lock();
            state.link_epoch += 1;
            state.link_epoch
        };
        warn!(
            "[kernel-connection] Channel to {} disconnected: {}",
            self.inner.kernel_id, reason
        );
        self.set_status(KernelStatus::Disconnected);

        match self.inner.config.disconnect_grace() {
            None => debug!("[kernel-connection] Holding pending requests until restart"),
            Some(grace) if grace.is_zero() => self.expire_disconnected(epoch),
            Some(grace) => {
                let weak = Arc::downgrade(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(inner) = weak.upgrade() {
                        KernelConnection { inner }.expire_disconnected(epoch);
                    }
                });
            }
        }
    }

    /// Fail requests sent before disconnect `epoch` that are still pending.
    fn expire_disconnected(&self, epoch: u64) {
        let expired: Vec<_> = {
            let mut state = self.lock();
            let ids: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, e)| e.epoch < epoch)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.pending.remove(id))
                .map(|e| e.future)
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        warn!(
            "[kernel-connection] Failing {} requests pending across disconnect {}",
            expired.len(),
            epoch
        );
        fail_all(
            expired,
            &KernelError::Transport("connection lost while the request was pending".into()),
        );
    }

    fn on_reconnected(&self) {
        self.set_status(KernelStatus::Connected);
        let future = self.request_kernel_info();
        let handshake = self.inner.config.handshake_timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(handshake, future.done()).await {
                Ok(Ok(_)) => debug!("[kernel-connection] Resynchronised after reconnect"),
                Ok(Err(e)) => warn!("[kernel-connection] kernel_info after reconnect failed: {}", e),
                Err(_) => {
                    warn!("[kernel-connection] kernel_info after reconnect timed out");
                    future.dispose();
                }
            }
        });
    }

    fn on_closed(&self, reason: CloseReason) {
        let pending: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            state.pending.drain().map(|(_, e)| e.future).collect()
        };
        let message = match &reason {
            CloseReason::Requested => {
                debug!("[kernel-connection] Channel closed");
                "channel closed".to_string()
            }
            CloseReason::RetriesExhausted(last) => {
                error!(
                    "[kernel-connection] Giving up on kernel {}: {}",
                    self.inner.kernel_id, last
                );
                format!("reconnect attempts exhausted: {}", last)
            }
        };
        self.set_status(KernelStatus::Disconnected);
        fail_all(pending, &KernelError::Transport(message));
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The last iopub `error` the kernel published for a request. Kernels may
/// send a bare `status: error` reply and carry the details only there.
fn published_error(future: &KernelFuture) -> Option<ReplyError> {
    future.replies().iter().rev().find_map(|message| match &message.content {
        MessageContent::Error(error) if message.channel == Channel::Iopub => Some(ReplyError {
            ename: error.ename.clone(),
            evalue: error.evalue.clone(),
            traceback: error.traceback.clone(),
        }),
        _ => None,
    })
}

/// Why a new request cannot be sent, if it cannot.
fn refusal(state: &ConnectionState) -> Result<()> {
    if state.closed {
        Err(KernelError::NotConnected)
    } else if state.status == KernelStatus::Dead {
        Err(KernelError::KernelDead)
    } else {
        Ok(())
    }
}

async fn run_events(inner: Weak<ConnectionInner>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        KernelConnection { inner }.handle_event(event);
    }
    debug!("[kernel-connection] Event loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_options_defaults() {
        let request = ExecuteOptions::default().to_request("1+1");
        assert_eq!(request, ExecuteRequest::new("1+1"));
    }

    #[test]
    fn test_silent_execute_options() {
        let options = ExecuteOptions {
            silent: true,
            store_history: false,
            ..Default::default()
        };
        let request = options.to_request("x");
        assert!(request.silent);
        assert!(!request.store_history);
        assert!(request.stop_on_error);
    }

    #[test]
    fn test_refusal() {
        let mut state = ConnectionState {
            status: KernelStatus::Idle,
            session_id: new_session_id(),
            retired_sessions: VecDeque::new(),
            generation: 0,
            link_epoch: 0,
            execution_count: 0,
            kernel_info: None,
            pending: HashMap::new(),
            closed: false,
        };
        assert!(refusal(&state).is_ok());
        state.status = KernelStatus::Dead;
        assert_eq!(refusal(&state), Err(KernelError::KernelDead));
        state.closed = true;
        assert_eq!(refusal(&state), Err(KernelError::NotConnected));
    }
}
