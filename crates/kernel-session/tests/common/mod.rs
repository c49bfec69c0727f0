//! In-memory kernel plumbing shared by the integration tests.
//!
//! [`MockTransport`] hands the test a [`Peer`] for every connect so the test
//! can play the kernel by hand. [`FakeProvider`] starts kernels whose peers
//! are driven by [`run_kernel`], a tiny scripted kernel.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::channel::mpsc as fmpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use jupyter_wire::{
    decode, encode, Channel, ErrorOutput, ExecuteInput, ExecuteReply, ExecuteResult,
    ExecutionState, Frame, InterruptReply, KernelInfoReply, Message, MessageContent, ReplyError,
    ReplyStatus, ShutdownReply, Status, Stream, StreamName,
};
use kernel_session::{
    BackoffConfig, CommRegistry, FrameSink, FrameStream, KernelClientConfig, KernelConnection,
    KernelError, KernelPreference, KernelProvider, Result, StartedKernel, Transport,
};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;

/// Kernel side of one link.
pub struct Peer {
    to_client: fmpsc::UnboundedSender<Result<Frame>>,
    from_client: fmpsc::UnboundedReceiver<Frame>,
}

impl Peer {
    /// Next message the client sent. Panics if the client hung up.
    pub async fn recv(&mut self) -> Message {
        self.next().await.expect("client hung up")
    }

    pub async fn next(&mut self) -> Option<Message> {
        let frame = self.from_client.next().await?;
        Some(decode(&frame).expect("client sent an undecodable frame"))
    }

    pub fn send(&self, message: Message) {
        self.send_frame(encode(&message).expect("encode"));
    }

    pub fn send_frame(&self, frame: Frame) {
        let _ = self.to_client.unbounded_send(Ok(frame));
    }

    /// Shell/control reply (or stdin request) parented to `request`.
    pub fn reply(&self, request: &Message, content: impl Into<MessageContent>) {
        self.send(Message::child_of(content, &request.header));
    }

    /// Iopub message parented to `request`.
    pub fn iopub(&self, request: &Message, content: impl Into<MessageContent>) {
        self.send(Message::child_of(content, &request.header).with_channel(Channel::Iopub));
    }

    pub fn status(&self, request: &Message, execution_state: ExecutionState) {
        self.iopub(request, Status { execution_state });
    }
}

/// Transport whose links are in-memory channels.
pub struct MockTransport {
    peers_tx: mpsc::UnboundedSender<Peer>,
    peers_rx: Mutex<mpsc::UnboundedReceiver<Peer>>,
    refuse: AtomicBool,
    connects: AtomicU32,
    /// Drive every new link with [`run_kernel`] instead of handing it out.
    auto: bool,
    kernels: StdMutex<Vec<AbortHandle>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    pub fn auto() -> Arc<Self> {
        Self::build(true)
    }

    fn build(auto: bool) -> Arc<Self> {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            peers_tx,
            peers_rx: Mutex::new(peers_rx),
            refuse: AtomicBool::new(false),
            connects: AtomicU32::new(0),
            auto,
            kernels: StdMutex::new(Vec::new()),
        })
    }

    pub async fn next_peer(&self) -> Peer {
        self.peers_rx
            .lock()
            .await
            .recv()
            .await
            .expect("transport dropped")
    }

    pub fn refuse_connects(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Kill every scripted kernel, dropping its end of the link.
    pub fn hang_up(&self) {
        for kernel in self.kernels.lock().unwrap().drain(..) {
            kernel.abort();
        }
    }
}

impl Transport for MockTransport {
    fn connect(&self) -> BoxFuture<'static, Result<(FrameSink, FrameStream)>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return async { Err(KernelError::Transport("connection refused".into())) }.boxed();
        }

        let (to_client, client_rx) = fmpsc::unbounded();
        let (client_tx, from_client) = fmpsc::unbounded();
        let peer = Peer {
            to_client,
            from_client,
        };
        if self.auto {
            let kernel = tokio::spawn(run_kernel(peer));
            self.kernels.lock().unwrap().push(kernel.abort_handle());
        } else {
            let _ = self.peers_tx.send(peer);
        }

        let sink: FrameSink =
            Box::pin(client_tx.sink_map_err(|e| KernelError::Transport(e.to_string())));
        let stream: FrameStream = Box::pin(client_rx);
        async move { Ok((sink, stream)) }.boxed()
    }
}

pub fn test_config() -> KernelClientConfig {
    KernelClientConfig {
        backoff: BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 400,
            max_retries: Some(3),
        },
        disconnect_grace_ms: None,
        handshake_timeout_ms: 1_000,
        request_timeout_ms: None,
        username: "test".into(),
    }
}

/// Connect to a hand-driven kernel.
pub async fn connect(config: KernelClientConfig) -> (KernelConnection, Peer, Arc<MockTransport>) {
    let transport = MockTransport::new();
    let connection = KernelConnection::connect("k1", transport.clone(), config, CommRegistry::new())
        .await
        .expect("connect");
    let peer = transport.next_peer().await;
    (connection, peer, transport)
}

/// Let every spawned task run until it is idle. Needs a paused clock.
pub async fn flush() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn bundle(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub fn execute_result(count: u64, text: &str) -> ExecuteResult {
    ExecuteResult {
        execution_count: count,
        data: bundle(json!({ "text/plain": text })),
        metadata: Map::new(),
        transient: None,
    }
}

pub fn stdout(text: &str) -> Stream {
    Stream {
        name: StreamName::Stdout,
        text: text.into(),
    }
}

pub fn reply_ok(count: u64) -> ExecuteReply {
    ExecuteReply {
        status: ReplyStatus::Ok,
        execution_count: Some(count),
        payload: Vec::new(),
        user_expressions: Map::new(),
        error: None,
    }
}

pub fn reply_error(count: u64, ename: &str, evalue: &str) -> ExecuteReply {
    ExecuteReply {
        status: ReplyStatus::Error,
        execution_count: Some(count),
        payload: Vec::new(),
        user_expressions: Map::new(),
        error: Some(ReplyError {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback: vec![format!("{}: {}", ename, evalue)],
        }),
    }
}

/// `status: error` with the details left to the iopub `error` message.
pub fn reply_bare_error(count: u64) -> ExecuteReply {
    ExecuteReply {
        status: ReplyStatus::Error,
        execution_count: Some(count),
        payload: Vec::new(),
        user_expressions: Map::new(),
        error: None,
    }
}

pub fn error_output(ename: &str, evalue: &str) -> ErrorOutput {
    ErrorOutput {
        ename: ename.into(),
        evalue: evalue.into(),
        traceback: vec![format!("{}: {}", ename, evalue)],
    }
}

pub fn reply_aborted() -> ExecuteReply {
    ExecuteReply {
        status: ReplyStatus::Abort,
        execution_count: None,
        payload: Vec::new(),
        user_expressions: Map::new(),
        error: None,
    }
}

pub fn kernel_info_ok() -> KernelInfoReply {
    KernelInfoReply {
        status: ReplyStatus::Ok,
        protocol_version: "5.3".into(),
        implementation: "fake".into(),
        implementation_version: "0.1".into(),
        language_info: json!({ "name": "python" }),
        banner: String::new(),
        error: None,
    }
}

/// A scripted kernel. It understands:
///
/// - `1+1` evaluates to `2`
/// - `print(...)` writes its argument to stdout
/// - `raise ...` fails with `ValueError`
/// - `sleep` runs until interrupted
pub async fn run_kernel(mut peer: Peer) {
    let mut count = 0;
    let mut sleeping: Option<Message> = None;

    while let Some(request) = peer.next().await {
        match &request.content {
            MessageContent::KernelInfoRequest(_) => {
                peer.status(&request, ExecutionState::Busy);
                peer.reply(&request, kernel_info_ok());
                peer.status(&request, ExecutionState::Idle);
            }
            MessageContent::ExecuteRequest(execute) => {
                count += 1;
                let code = execute.code.trim();
                peer.status(&request, ExecutionState::Busy);
                peer.iopub(
                    &request,
                    ExecuteInput {
                        code: code.to_string(),
                        execution_count: count,
                    },
                );
                if code == "sleep" {
                    sleeping = Some(request.clone());
                    continue;
                }
                if code == "1+1" {
                    peer.iopub(&request, execute_result(count, "2"));
                    peer.reply(&request, reply_ok(count));
                } else if let Some(text) = code
                    .strip_prefix("print(")
                    .and_then(|rest| rest.strip_suffix(')'))
                {
                    peer.iopub(&request, stdout(&format!("{}\n", text.trim_matches('\''))));
                    peer.reply(&request, reply_ok(count));
                } else if code.starts_with("raise") {
                    peer.iopub(
                        &request,
                        ErrorOutput {
                            ename: "ValueError".into(),
                            evalue: "x".into(),
                            traceback: vec!["ValueError: x".into()],
                        },
                    );
                    peer.reply(&request, reply_error(count, "ValueError", "x"));
                } else {
                    peer.reply(&request, reply_ok(count));
                }
                peer.status(&request, ExecutionState::Idle);
            }
            MessageContent::InterruptRequest(_) => {
                if let Some(running) = sleeping.take() {
                    peer.iopub(
                        &running,
                        ErrorOutput {
                            ename: "KeyboardInterrupt".into(),
                            evalue: String::new(),
                            traceback: Vec::new(),
                        },
                    );
                    peer.reply(&running, reply_error(count, "KeyboardInterrupt", ""));
                    peer.status(&running, ExecutionState::Idle);
                }
                peer.reply(
                    &request,
                    InterruptReply {
                        status: ReplyStatus::Ok,
                        error: None,
                    },
                );
            }
            MessageContent::ShutdownRequest(shutdown) => {
                peer.reply(
                    &request,
                    ShutdownReply {
                        status: ReplyStatus::Ok,
                        restart: shutdown.restart,
                        error: None,
                    },
                );
            }
            _ => {}
        }
    }
}

/// Provider whose kernels are [`run_kernel`] tasks.
#[derive(Default)]
pub struct FakeProvider {
    started: AtomicU32,
    restarts: AtomicU32,
    pub shutdowns: StdMutex<Vec<String>>,
    transports: StdMutex<Vec<Arc<MockTransport>>>,
    pub fail_restart: AtomicBool,
    pub fail_start: AtomicBool,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Transport of the most recently started kernel.
    pub fn last_transport(&self) -> Arc<MockTransport> {
        self.transports
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no kernel started")
    }
}

impl KernelProvider for FakeProvider {
    fn start_kernel(
        &self,
        preference: KernelPreference,
        _path: String,
    ) -> BoxFuture<'static, Result<StartedKernel>> {
        if self.fail_start.load(Ordering::SeqCst) {
            return async { Err(KernelError::Provider("no such kernel".into())) }.boxed();
        }
        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let transport = MockTransport::auto();
        self.transports.lock().unwrap().push(transport.clone());
        let started = StartedKernel {
            kernel_id: format!("{}-{}", preference.name, n),
            transport,
        };
        async move { Ok(started) }.boxed()
    }

    fn restart_kernel(&self, _kernel_id: String) -> BoxFuture<'static, Result<()>> {
        if self.fail_restart.load(Ordering::SeqCst) {
            return async { Err(KernelError::Provider("restart failed".into())) }.boxed();
        }
        self.restarts.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }.boxed()
    }

    fn shutdown_kernel(&self, kernel_id: String) -> BoxFuture<'static, Result<()>> {
        self.shutdowns.lock().unwrap().push(kernel_id);
        async { Ok(()) }.boxed()
    }
}
