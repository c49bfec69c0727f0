//! Handles for outstanding kernel requests.
//!
//! A [`KernelFuture`] collects every message parented to its request, in
//! arrival order, and settles exactly once: with the terminal reply on
//! success, or with a [`KernelError`]. The kernel connection only keeps a
//! weak reference, so dropping every clone of a future abandons the request.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use jupyter_wire::Message;
use log::{debug, warn};
use tokio::sync::watch;

use crate::error::{KernelError, Result};

pub type ReplyCallback = Box<dyn FnMut(&Message) + Send>;
pub type DoneCallback = Box<dyn FnOnce(&Result<Message>) + Send>;
pub(crate) type DetachHook = Box<dyn FnOnce(&str) + Send>;

struct ReplyListener {
    /// `None` listens to every message type.
    msg_type: Option<String>,
    /// Number of replies this listener has already been shown.
    seen: usize,
    callback: ReplyCallback,
}

#[derive(Default)]
struct FutureState {
    replies: Vec<Message>,
    listeners: Vec<ReplyListener>,
    on_done: Vec<DoneCallback>,
    result: Option<Result<Message>>,
    dispatching: bool,
}

pub(crate) struct FutureShared {
    msg_id: String,
    msg_type: String,
    state: StdMutex<FutureState>,
    done: watch::Sender<Option<Result<Message>>>,
    detach: StdMutex<Option<DetachHook>>,
}

/// One outstanding request.
#[derive(Clone)]
pub struct KernelFuture {
    shared: Arc<FutureShared>,
}

impl std::fmt::Debug for KernelFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelFuture")
            .field("msg_id", &self.shared.msg_id)
            .field("msg_type", &self.shared.msg_type)
            .field("done", &self.is_done())
            .finish()
    }
}

impl KernelFuture {
    pub(crate) fn new(msg_id: impl Into<String>, msg_type: impl Into<String>) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            shared: Arc::new(FutureShared {
                msg_id: msg_id.into(),
                msg_type: msg_type.into(),
                state: StdMutex::new(FutureState::default()),
                done,
                detach: StdMutex::new(None),
            }),
        }
    }

    /// A future that is already rejected; nothing was sent.
    pub(crate) fn rejected(
        msg_id: impl Into<String>,
        msg_type: impl Into<String>,
        err: KernelError,
    ) -> Self {
        let future = Self::new(msg_id, msg_type);
        future.settle(Err(err));
        future
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<FutureShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn from_shared(shared: Arc<FutureShared>) -> Self {
        Self { shared }
    }

    /// Id of the request message; replies carry it as `parent_header.msg_id`.
    pub fn msg_id(&self) -> &str {
        &self.shared.msg_id
    }

    /// Type of the request message, e.g. `execute_request`.
    pub fn msg_type(&self) -> &str {
        &self.shared.msg_type
    }

    /// Call `callback` for every reply of type `msg_type`.
    ///
    /// Replies that arrived before registration are replayed first, so a
    /// listener always sees the full sequence in arrival order.
    pub fn on_reply(&self, msg_type: &str, callback: impl FnMut(&Message) + Send + 'static) {
        self.add_listener(Some(msg_type.to_string()), Box::new(callback));
    }

    /// Call `callback` for every reply regardless of type.
    pub fn on_any(&self, callback: impl FnMut(&Message) + Send + 'static) {
        self.add_listener(None, Box::new(callback));
    }

    /// Call `callback` once when the future settles. Fires immediately if it
    /// already has.
    pub fn on_done(&self, callback: impl FnOnce(&Result<Message>) + Send + 'static) {
        let mut state = self.lock();
        match state.result.clone() {
            Some(result) => {
                drop(state);
                callback(&result);
            }
            None => state.on_done.push(Box::new(callback)),
        }
    }

    /// Wait for the terminal outcome. Any number of holders may await it.
    pub async fn done(&self) -> Result<Message> {
        let mut rx = self.shared.done.subscribe();
        let settled = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        settled.unwrap_or(Err(KernelError::Disposed))
    }

    /// Replies received so far, in arrival order.
    pub fn replies(&self) -> Vec<Message> {
        self.lock().replies.clone()
    }

    pub fn is_done(&self) -> bool {
        self.lock().result.is_some()
    }

    /// The outcome, if settled.
    pub fn result(&self) -> Option<Result<Message>> {
        self.lock().result.clone()
    }

    /// Abandon the request without telling the kernel.
    ///
    /// The entry leaves the pending map and the future settles with
    /// [`KernelError::Disposed`]. No-op once settled.
    pub fn dispose(&self) {
        self.cancel(KernelError::Disposed);
    }

    pub(crate) fn set_detach(&self, hook: DetachHook) {
        *self
            .shared
            .detach
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(hook);
    }

    /// Detach from the pending map and settle with `err`.
    pub(crate) fn cancel(&self, err: KernelError) {
        if self.is_done() {
            return;
        }
        let hook = self
            .shared
            .detach
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(hook) = hook {
            hook(&self.shared.msg_id);
        }
        debug!(
            "[kernel-connection] Cancelling {} ({}): {}",
            self.shared.msg_id, self.shared.msg_type, err
        );
        self.settle(Err(err));
    }

    /// Settle with `err` after `timeout` unless settled earlier.
    pub(crate) fn arm_timeout(&self, timeout: Duration) {
        let weak = self.downgrade();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(shared) = weak.upgrade() {
                        KernelFuture::from_shared(shared).cancel(KernelError::Timeout(timeout));
                    }
                });
            }
            Err(_) => warn!(
                "[kernel-connection] No async runtime; timeout for {} ignored",
                self.shared.msg_id
            ),
        }
    }

    /// Append a reply and run listeners. Replies after settlement are ignored.
    pub(crate) fn deliver(&self, message: Message) -> bool {
        {
            let mut state = self.lock();
            if state.result.is_some() {
                debug!(
                    "[kernel-connection] Ignoring late {} for settled {}",
                    message.msg_type(),
                    self.shared.msg_id
                );
                return false;
            }
            state.replies.push(message);
        }
        self.dispatch();
        true
    }

    /// Settle the future. Returns false if it was already settled.
    pub(crate) fn settle(&self, result: Result<Message>) -> bool {
        let callbacks = {
            let mut state = self.lock();
            if state.result.is_some() {
                return false;
            }
            state.result = Some(result.clone());
            std::mem::take(&mut state.on_done)
        };
        self.shared
            .detach
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        for callback in callbacks {
            callback(&result);
        }
        self.shared.done.send_replace(Some(result));
        true
    }

    fn add_listener(&self, msg_type: Option<String>, callback: ReplyCallback) {
        self.lock().listeners.push(ReplyListener {
            msg_type,
            seen: 0,
            callback,
        });
        self.dispatch();
    }

    /// Show every listener the replies it has not seen yet.
    ///
    /// Listeners run without the state lock held. Only one thread drains at
    /// a time; others leave their work for the draining thread.
    fn dispatch(&self) {
        let mut state = self.lock();
        if state.dispatching {
            return;
        }
        state.dispatching = true;
        let _draining = DrainGuard(self);

        loop {
            let total = state.replies.len();
            let low = state
                .listeners
                .iter()
                .map(|l| l.seen)
                .min()
                .unwrap_or(total);
            if low >= total {
                break;
            }

            let fresh: Vec<Message> = state.replies[low..total].to_vec();
            let mut listeners = std::mem::take(&mut state.listeners);
            drop(state);

            for listener in listeners.iter_mut() {
                for message in &fresh[listener.seen - low..] {
                    let wanted = listener
                        .msg_type
                        .as_deref()
                        .map_or(true, |t| t == message.msg_type());
                    if wanted {
                        (listener.callback)(message);
                    }
                }
                listener.seen = total;
            }

            state = self.lock();
            listeners.append(&mut state.listeners);
            state.listeners = listeners;
        }

        drop(state);
    }

    fn lock(&self) -> MutexGuard<'_, FutureState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Clears the draining flag even when a listener panics, so later replies
/// still reach the listeners that remain.
struct DrainGuard<'a>(&'a KernelFuture);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().dispatching = false;
    }
}
