//! Persistent kernel channel with automatic reconnect.
//!
//! [`open`] connects a [`Transport`] and spawns a driver task that pumps
//! frames in both directions. When the link drops unexpectedly the driver
//! reconnects on the [`BackoffConfig`] schedule; an explicit
//! [`ChannelHandle::close`] stops it for good.

use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{Sink, SinkExt, Stream, StreamExt};
use jupyter_wire::Frame;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::config::BackoffConfig;
use crate::error::{KernelError, Result};

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = KernelError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Something that can (re)establish the raw frame link to a kernel.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<(FrameSink, FrameStream)>>;
}

/// Why a channel stopped for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// [`ChannelHandle::close`] was called or every handle was dropped.
    Requested,
    /// Reconnect attempts ran out; carries the last connect error.
    RetriesExhausted(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Frame(Frame),
    /// The link dropped; the channel is retrying.
    Disconnected { reason: String },
    Reconnected,
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
    Closed,
}

enum Command {
    Send(Frame),
    Close,
}

/// Cheap, cloneable handle for sending on and closing a channel.
#[derive(Clone)]
pub struct ChannelHandle {
    commands: mpsc::UnboundedSender<Command>,
    link: watch::Receiver<LinkState>,
}

impl ChannelHandle {
    /// Queue a frame for sending. Fails fast while the link is down.
    pub fn send(&self, frame: Frame) -> Result<()> {
        match *self.link.borrow() {
            LinkState::Up => {}
            LinkState::Down => {
                return Err(KernelError::Transport("channel is disconnected".into()))
            }
            LinkState::Closed => return Err(KernelError::Transport("channel is closed".into())),
        }
        self.commands
            .send(Command::Send(frame))
            .map_err(|_| KernelError::Transport("channel is closed".into()))
    }

    /// Close the channel. No reconnect is attempted afterwards.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }
}

/// Connect `transport` and start the channel driver.
///
/// The first connect is not retried; its error is returned to the caller.
pub async fn open(
    transport: Arc<dyn Transport>,
    backoff: BackoffConfig,
) -> Result<(ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>)> {
    let (sink, stream) = transport.connect().await?;
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = watch::channel(LinkState::Up);

    let driver = Driver {
        transport,
        backoff,
        commands: command_rx,
        events: event_tx,
        link: link_tx,
    };
    tokio::spawn(driver.run(sink, stream));

    Ok((
        ChannelHandle {
            commands: command_tx,
            link: link_rx,
        },
        event_rx,
    ))
}

struct Driver {
    transport: Arc<dyn Transport>,
    backoff: BackoffConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    link: watch::Sender<LinkState>,
}

enum LinkEnd {
    Dropped(String),
    CloseRequested,
}

impl Driver {
    async fn run(mut self, mut sink: FrameSink, mut stream: FrameStream) {
        loop {
            match self.pump(&mut sink, &mut stream).await {
                LinkEnd::CloseRequested => {
                    let _ = sink.close().await;
                    self.finish(CloseReason::Requested);
                    return;
                }
                LinkEnd::Dropped(reason) => {
                    warn!("[channel] Link dropped: {}", reason);
                    self.link.send_replace(LinkState::Down);
                    self.emit(ChannelEvent::Disconnected { reason });
                }
            }

            match self.reconnect().await {
                Ok((next_sink, next_stream)) => {
                    sink = next_sink;
                    stream = next_stream;
                    self.link.send_replace(LinkState::Up);
                    info!("[channel] Reconnected");
                    self.emit(ChannelEvent::Reconnected);
                }
                Err(reason) => {
                    self.finish(reason);
                    return;
                }
            }
        }
    }

    async fn pump(&mut self, sink: &mut FrameSink, stream: &mut FrameStream) -> LinkEnd {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send(frame)) => {
                        if let Err(e) = sink.send(frame).await {
                            return LinkEnd::Dropped(e.to_string());
                        }
                    }
                    Some(Command::Close) | None => return LinkEnd::CloseRequested,
                },
                item = stream.next() => match item {
                    Some(Ok(frame)) => self.emit(ChannelEvent::Frame(frame)),
                    Some(Err(e)) => return LinkEnd::Dropped(e.to_string()),
                    None => return LinkEnd::Dropped("transport closed".into()),
                },
            }
        }
    }

    async fn reconnect(&mut self) -> std::result::Result<(FrameSink, FrameStream), CloseReason> {
        let mut attempt = 0u32;
        let mut last_error = String::from("no reconnect attempts allowed");

        while self.backoff.allows(attempt) {
            let delay = self.backoff.delay(attempt);
            debug!(
                "[channel] Reconnect attempt {} in {}ms",
                attempt + 1,
                delay.as_millis()
            );
            let deadline = Instant::now() + delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    command = self.commands.recv() => match command {
                        Some(Command::Send(_)) => {
                            debug!("[channel] Dropping frame queued while disconnected");
                        }
                        Some(Command::Close) | None => return Err(CloseReason::Requested),
                    },
                }
            }

            match self.transport.connect().await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    warn!("[channel] Reconnect attempt {} failed: {}", attempt + 1, e);
                    last_error = e.to_string();
                    attempt += 1;
                }
            }
        }

        Err(CloseReason::RetriesExhausted(last_error))
    }

    fn finish(&self, reason: CloseReason) {
        info!("[channel] Closed: {:?}", reason);
        self.link.send_replace(LinkState::Closed);
        self.emit(ChannelEvent::Closed(reason));
    }

    fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            debug!("[channel] Event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Server side of one scripted link.
    struct Peer {
        to_client: fmpsc::UnboundedSender<Result<Frame>>,
        from_client: fmpsc::UnboundedReceiver<Frame>,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        outcomes: StdMutex<VecDeque<std::result::Result<(), String>>>,
        peers: StdMutex<Vec<Peer>>,
        connects: StdMutex<u32>,
    }

    impl ScriptedTransport {
        fn with_outcomes(outcomes: Vec<std::result::Result<(), String>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: StdMutex::new(outcomes.into()),
                ..Default::default()
            })
        }

        fn take_peer(&self) -> Peer {
            self.peers.lock().unwrap().remove(0)
        }

        fn connects(&self) -> u32 {
            *self.connects.lock().unwrap()
        }
    }

    impl Transport for ScriptedTransport {
        fn connect(&self) -> BoxFuture<'static, Result<(FrameSink, FrameStream)>> {
            *self.connects.lock().unwrap() += 1;
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err("refused".into()));
            let result = outcome.map(|()| {
                let (to_client, client_rx) = fmpsc::unbounded();
                let (client_tx, from_client) = fmpsc::unbounded();
                self.peers.lock().unwrap().push(Peer {
                    to_client,
                    from_client,
                });
                let sink: FrameSink = Box::pin(
                    client_tx.sink_map_err(|e| KernelError::Transport(e.to_string())),
                );
                let stream: FrameStream = Box::pin(client_rx);
                (sink, stream)
            });
            Box::pin(async move { result.map_err(KernelError::Transport) })
        }
    }

    fn backoff(max_retries: Option<u32>) -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 400,
            max_retries,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_flow_both_ways() {
        let transport = ScriptedTransport::with_outcomes(vec![Ok(())]);
        let (handle, mut events) = open(transport.clone(), backoff(Some(1))).await.unwrap();
        let mut peer = transport.take_peer();

        handle.send(Frame::Text("out".into())).unwrap();
        assert_eq!(peer.from_client.next().await, Some(Frame::Text("out".into())));

        peer.to_client.unbounded_send(Ok(Frame::Text("in".into()))).unwrap();
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Frame(Frame::Text("in".into())))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_unexpected_drop() {
        let transport = ScriptedTransport::with_outcomes(vec![Ok(()), Err("busy".into()), Ok(())]);
        let (handle, mut events) = open(transport.clone(), backoff(Some(5))).await.unwrap();

        drop(transport.take_peer());
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Disconnected { .. })
        ));
        assert_eq!(handle.link_state(), LinkState::Down);
        assert!(matches!(
            handle.send(Frame::Text("x".into())),
            Err(KernelError::Transport(_))
        ));

        let started = Instant::now();
        assert_eq!(events.recv().await, Some(ChannelEvent::Reconnected));
        // one failed attempt after 100ms, the successful one 200ms later
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(transport.connects(), 3);
        assert_eq!(handle.link_state(), LinkState::Up);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_closes() {
        let transport = ScriptedTransport::with_outcomes(vec![Ok(())]);
        let (handle, mut events) = open(transport.clone(), backoff(Some(2))).await.unwrap();

        drop(transport.take_peer());
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Disconnected { .. })
        ));
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Closed(CloseReason::RetriesExhausted(
                "transport error: refused".into()
            )))
        );
        assert_eq!(transport.connects(), 3);
        assert_eq!(handle.link_state(), LinkState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconnect_after_close() {
        let transport = ScriptedTransport::with_outcomes(vec![Ok(()), Ok(())]);
        let (handle, mut events) = open(transport.clone(), backoff(None)).await.unwrap();

        handle.close();
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Closed(CloseReason::Requested))
        );
        assert_eq!(events.recv().await, None);
        assert_eq!(transport.connects(), 1);
        assert!(handle.send(Frame::Text("late".into())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_backoff() {
        let transport = ScriptedTransport::with_outcomes(vec![Ok(())]);
        let (handle, mut events) = open(transport.clone(), backoff(None)).await.unwrap();

        drop(transport.take_peer());
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Disconnected { .. })
        ));
        handle.close();
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Closed(CloseReason::Requested))
        );
        assert_eq!(transport.connects(), 1);
    }
}
