#![warn(missing_docs)]

//! Rootwire transport: client-side wire protocol engine for XRootD-style
//! storage servers. Handshake, login and authentication, stream id
//! bookkeeping, sub-stream multiplexing and idle policy.
//!
//! The engine never touches a socket itself; [`tcp`] is a tokio driver that
//! feeds it.

pub mod auth;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod handshake;
pub mod idle;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod multiplex;
pub mod protocol;
pub mod sid;
pub mod tcp;

pub use auth::{
    AuthEnv, AuthProvider, AuthProviderRegistry, AuthSession, AuthStep, ProviderRegistry,
    ResolveRequest,
};
pub use channel::{
    Channel, ChannelQuery, ChannelUrl, PathId, QueryAnswer, ReceivedAction, StreamInfo,
    StreamStatus,
};
pub use codec::{
    decode_request, decode_response, encode_request, encode_response, ClientRequest,
    RequestBody, ResponseBody, ServerResponse,
};
pub use config::{DownlinkPolicy, TransportConfig};
pub use error::{ErrorCode, Result, Severity, TransportError};
pub use handshake::{HandshakeContext, HandshakeStep};
pub use message::Message;
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use sid::StreamIdAllocator;
pub use tcp::SubStreamConnection;
