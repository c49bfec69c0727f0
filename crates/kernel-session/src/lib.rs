//! kernel-session - Kernel communication and execution sessions.
//!
//! Everything a notebook front end needs to talk to one Jupyter kernel over a
//! single websocket: a reconnecting [`channel`], a [`KernelConnection`] that
//! correlates replies with the requests that caused them, [`KernelFuture`]
//! handles for outstanding requests, the comm (widget) [`CommRegistry`], a
//! [`Session`] that owns the kernel lifecycle for a document, and the
//! [`Notebook`] model fed by execute replies.
//!
//! Messages are decoded by the `jupyter-wire` crate.

pub mod channel;
pub mod comm;
pub mod config;
pub mod connection;
pub mod error;
pub mod future;
pub mod jupyter_server;
pub mod notebook;
pub mod output;
pub mod renderer;
pub mod session;
pub mod signal;
pub mod status;
pub mod store;

pub use channel::{ChannelEvent, ChannelHandle, CloseReason, FrameSink, FrameStream, Transport};
pub use comm::{Comm, CommHandler, CommRegistry, CommSnapshot};
pub use config::{load_settings, load_settings_from, save_settings_to, settings_path};
pub use config::{BackoffConfig, KernelClientConfig};
pub use connection::{ExecuteOptions, KernelConnection};
pub use error::{KernelError, Result};
pub use future::KernelFuture;
pub use jupyter_server::{JupyterServerProvider, KernelModel, WebSocketTransport};
pub use notebook::{Cell, CellError, CellState, CellType, Notebook, NotebookError, NotebookEvent};
pub use output::Output;
pub use renderer::{DisplayHandle, RendererRegistry};
pub use session::{KernelPreference, KernelProvider, Session, StartedKernel};
pub use signal::{Signal, Subscription};
pub use status::KernelStatus;
pub use store::{DocumentCell, JsonFileStore, NotebookDocument, NotebookStore, StoreError};
