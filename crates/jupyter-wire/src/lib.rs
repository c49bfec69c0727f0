//! Jupyter message envelopes and the websocket frame codec.
//!
//! This crate has no connection state. It provides:
//!
//! - [`Message`] and [`Header`], the envelope shared by all four channels
//! - [`MessageContent`], typed content keyed by `msg_type`, with unknown
//!   message types preserved verbatim
//! - [`encode`] / [`decode`] for the text and binary websocket framings used
//!   by the Jupyter server

mod codec;
mod content;
mod message;

pub use codec::{decode, encode, CodecError, Frame};
pub use content::{
    ClearOutput, CommClose, CommInfoReply, CommInfoRequest, CommMsg, CommOpen, CompleteReply,
    CompleteRequest, DisplayData, ErrorOutput, ExecuteInput, ExecuteReply, ExecuteRequest,
    ExecuteResult, ExecutionState, InputReply, InputRequest, InspectReply, InspectRequest,
    InterruptReply, InterruptRequest, KernelInfoReply, KernelInfoRequest, MessageContent,
    MimeBundle, ReplyError, ReplyStatus, ShutdownReply, ShutdownRequest, Status, Stream,
    StreamName, Transient, UpdateDisplayData,
};
pub use message::{Channel, Header, Message, RawMessage, PROTOCOL_VERSION};
