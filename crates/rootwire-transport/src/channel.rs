//! Shared state of one logical connection and its sub-streams.
//!
//! A [`Channel`] is shared by every caller that talks to the same server.
//! All mutation happens under a single mutex, held only for short,
//! non-blocking critical sections; socket I/O and credential computation
//! always happen outside of it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::auth::{AuthProviderRegistry, AuthSession};
use crate::codec::{ClientRequest, ResponseBody, ServerResponse, SessionId, StreamId};
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::metrics::TransportMetrics;
use crate::protocol::{RequestId, ResponseStatus, ServerFlags, SESSION_ID_SIZE};
use crate::sid::StreamIdAllocator;

/// Endpoint and credential source of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelUrl {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Login name; empty means the local user.
    pub username: String,
    /// Handed to authentication providers.
    pub password: String,
    /// CGI parameters of the URL.
    pub params: BTreeMap<String, String>,
    /// Opaque token appended to the login CGI.
    pub login_token: String,
}

impl ChannelUrl {
    /// Anonymous URL for `host:port`.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    /// Sets the login name.
    pub fn with_user(mut self, username: &str) -> Self {
        self.username = username.to_string();
        self
    }

    /// Adds a CGI parameter.
    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    /// `user@host:port`, or `host:port` without a user.
    pub fn host_id(&self) -> String {
        if self.username.is_empty() {
            format!("{}:{}", self.host, self.port)
        } else {
            format!("{}@{}:{}", self.username, self.host, self.port)
        }
    }
}

/// Handshake progress of one sub-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStatus {
/// No socket, nothing sent.
    Disconnected,
/// Failed; only a new handshake leads out.
    Broken,
/// Initial handshake and protocol request written.
    HandshakeSent,
/// Server handshake read, protocol reply pending.
    HandshakeReceived,
/// Login written.
    LoginSent,
/// Authentication round in flight.
    AuthSent,
/// Bind written on a parallel sub-stream.
    BindSent,
/// Ending the previous session after a re-login.
    EndSessionSent,
/// Ready for requests.
    Connected,
}

impl StreamStatus {
    /// Position along the handshake; only `Broken`/`Disconnected` go back.
    pub fn rank(self) -> u8 {
        match self {
            StreamStatus::Disconnected | StreamStatus::Broken => 0,
            StreamStatus::HandshakeSent => 1,
            StreamStatus::HandshakeReceived => 2,
            StreamStatus::LoginSent | StreamStatus::BindSent => 3,
            StreamStatus::AuthSent => 4,
            StreamStatus::EndSessionSent => 5,
            StreamStatus::Connected => 6,
        }
    }
}

/// Per sub-stream bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    /// Handshake progress.
    pub status: StreamStatus,
    /// Server assigned id, meaningful only once connected through bind.
    pub path_id: u8,
    /// Responses expected on this sub-stream as downlink.
    pub outstanding: u32,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            status: StreamStatus::Disconnected,
            path_id: 0,
            outstanding: 0,
        }
    }
}

/// Uplink/downlink sub-stream pair chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PathId {
    /// Sub-stream the request is written to.
    pub up: u16,
    /// Sub-stream the response is expected on.
    pub down: u16,
}

impl PathId {
    /// Pairs an uplink with a downlink.
    pub fn new(up: u16, down: u16) -> Self {
        Self { up, down }
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.up, self.down)
    }
}

/// What the caller must do with a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivedAction {
    /// Deliver as usual.
    NoAction,
    /// Stale reply to a timed-out request; drop it.
    DigestMsg,
    /// Late success of a timed-out open; the caller must close the handle.
    RequestClose,
}

/// Questions a caller may ask about a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelQuery {
/// Protocol name.
    Name,
/// Accepted authentication mechanism.
    Auth,
/// Role and attributes of the server.
    ServerFlags,
/// Negotiated protocol version.
    ProtocolVersion,
}

impl ChannelQuery {
    /// Maps a numeric query code.
    pub fn from_code(code: u16) -> Result<Self> {
        match code {
            1 => Ok(ChannelQuery::Name),
            2 => Ok(ChannelQuery::Auth),
            1002 => Ok(ChannelQuery::ServerFlags),
            1003 => Ok(ChannelQuery::ProtocolVersion),
            other => Err(TransportError::QueryNotSupported(other)),
        }
    }
}

/// Answer to a [`ChannelQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryAnswer {
/// Always `XRootD`.
    Name(&'static str),
    /// Accepted mechanism, empty when no authentication took place.
    Auth(String),
/// Role and attributes of the server.
    ServerFlags(ServerFlags),
/// Protocol version from the server handshake.
    ProtocolVersion(u32),
}

/// Round-robin selector over the server's bind interface preferences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindPreferences {
    prefs: Vec<String>,
    next: usize,
}

impl BindPreferences {
    /// Starts at the first preference.
    pub fn new(prefs: Vec<String>) -> Self {
        Self { prefs, next: 0 }
    }

    /// Next preference, wrapping around.
    pub fn next_preference(&mut self) -> Option<String> {
        if self.prefs.is_empty() {
            return None;
        }
        let pref = self.prefs[self.next % self.prefs.len()].clone();
        self.next = (self.next + 1) % self.prefs.len();
        Some(pref)
    }
}

/// Everything guarded by the channel mutex.
#[derive(Debug)]
pub(crate) struct ChannelState {
    pub(crate) stream_name: String,
    pub(crate) session_id: SessionId,
    pub(crate) old_session_id: SessionId,
    pub(crate) first_login: bool,
    pub(crate) server_flags: ServerFlags,
    pub(crate) protocol_version: u32,
    pub(crate) substreams: Vec<StreamInfo>,
    pub(crate) sids: StreamIdAllocator,
    pub(crate) sent_opens: HashSet<StreamId>,
    pub(crate) sent_closes: HashSet<StreamId>,
    pub(crate) open_files: u32,
    pub(crate) wait_barrier: Option<Instant>,
    /// Negotiation in progress; taken out while a provider computes.
    pub(crate) auth: Option<AuthSession>,
    pub(crate) auth_mechanism: String,
    /// Bumped whenever the primary is broken or disconnected.
    pub(crate) auth_epoch: u64,
    pub(crate) bind_prefs: BindPreferences,
}

impl ChannelState {
    fn new(stream_name: String, substreams: u16) -> Self {
        Self {
            stream_name,
            session_id: [0; SESSION_ID_SIZE],
            old_session_id: [0; SESSION_ID_SIZE],
            first_login: true,
            server_flags: ServerFlags::default(),
            protocol_version: 0,
            substreams: vec![StreamInfo::default(); usize::from(substreams.max(1))],
            sids: StreamIdAllocator::new(),
            sent_opens: HashSet::new(),
            sent_closes: HashSet::new(),
            open_files: 0,
            wait_barrier: None,
            auth: None,
            auth_mechanism: String::new(),
            auth_epoch: 0,
            bind_prefs: BindPreferences::default(),
        }
    }

    fn raise_wait_barrier(&mut self, barrier: Instant) -> bool {
        match self.wait_barrier {
            Some(current) if current >= barrier => false,
            _ => {
                self.wait_barrier = Some(barrier);
                true
            }
        }
    }
}

/// One logical connection to a server.
pub struct Channel {
    url: ChannelUrl,
    config: TransportConfig,
    registry: Arc<dyn AuthProviderRegistry>,
    metrics: Arc<TransportMetrics>,
    state: Mutex<ChannelState>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("url", &self.url.host_id())
            .field("config", &self.config)
            .finish()
    }
}

impl Channel {
    /// Creates a channel sized to `config.substreams_per_channel`.
    pub fn new(
        url: ChannelUrl,
        config: TransportConfig,
        registry: Arc<dyn AuthProviderRegistry>,
    ) -> Self {
        let state = ChannelState::new(url.host_id(), config.substreams_per_channel);
        Self {
            url,
            config,
            registry,
            metrics: Arc::new(TransportMetrics::new()),
            state: Mutex::new(state),
        }
    }

    /// Shares an existing metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<TransportMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

/// Endpoint this channel talks to.
    pub fn url(&self) -> &ChannelUrl {
        &self.url
    }

/// Settings the channel was created with.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

/// Counters shared by every sub-stream of the channel.
    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    pub(crate) fn registry(&self) -> &dyn AuthProviderRegistry {
        self.registry.as_ref()
    }

    /// Locks the state. A poisoned lock is recovered: every critical
    /// section leaves the state consistent before it can panic.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

/// Name used in log lines.
    pub fn stream_name(&self) -> String {
        self.lock().stream_name.clone()
    }

/// Status of `substream`, `None` when out of range.
    pub fn stream_status(&self, substream: u16) -> Option<StreamStatus> {
        self.lock()
            .substreams
            .get(usize::from(substream))
            .map(|s| s.status)
    }

    /// Path id of a connected sub-stream.
    pub fn path_id(&self, substream: u16) -> Option<u8> {
        self.lock()
            .substreams
            .get(usize::from(substream))
            .filter(|s| s.status == StreamStatus::Connected)
            .map(|s| s.path_id)
    }

/// Session id of the last login.
    pub fn session_id(&self) -> SessionId {
        self.lock().session_id
    }

/// Server role from the handshake and protocol replies.
    pub fn server_flags(&self) -> ServerFlags {
        self.lock().server_flags
    }

/// Server protocol version.
    pub fn protocol_version(&self) -> u32 {
        self.lock().protocol_version
    }

/// Files opened and not yet closed.
    pub fn open_files(&self) -> u32 {
        self.lock().open_files
    }

/// Until then the server asked us to wait; idle checks hold off.
    pub fn wait_barrier(&self) -> Option<Instant> {
        self.lock().wait_barrier
    }

    /// Next bind interface preference announced by the server.
    pub fn bind_preference(&self) -> Option<String> {
        self.lock().bind_prefs.next_preference()
    }

/// Reserves a stream id for a new request.
    pub fn allocate_sid(&self) -> Result<StreamId> {
        self.lock().sids.allocate()
    }

/// Like [`Channel::allocate_sid`] with an explicit issue time.
    pub fn allocate_sid_at(&self, now: Instant) -> Result<StreamId> {
        self.lock().sids.allocate_at(now)
    }

/// Returns a stream id once its final response arrived.
    pub fn release_sid(&self, sid: StreamId) {
        self.lock().sids.release(sid);
    }

/// Keeps `sid` reserved so a late reply can be recognised as stale.
    pub fn mark_sid_timed_out(&self, sid: StreamId) {
        self.lock().sids.mark_timed_out(sid);
    }

    /// Outstanding stream ids, timed-out ones excluded.
    pub fn allocated_sids(&self) -> usize {
        self.lock().sids.allocated_count()
    }

    /// Records opens and closes leaving on the wire.
    pub fn message_sent(&self, request: &ClientRequest, substream: u16) {
        let mut state = self.lock();
        match request.request_id() {
            Some(RequestId::Open) => {
                state.sent_opens.insert(request.stream_id);
            }
            Some(RequestId::Close) => {
                state.sent_closes.insert(request.stream_id);
            }
            _ => {}
        }
        trace!(
            stream = %state.stream_name,
            substream = substream,
            sid = ?request.stream_id,
            "request sent"
        );
    }

    /// Updates the bookkeeping for a response read from `substream`.
    pub fn message_received(&self, response: &ServerResponse, substream: u16) -> ReceivedAction {
        self.message_received_at(response, substream, Instant::now())
    }

/// Like [`Channel::message_received`] with an explicit clock.
    pub fn message_received_at(
        &self,
        response: &ServerResponse,
        substream: u16,
        now: Instant,
    ) -> ReceivedAction {
        let mut state = self.lock();
        let status = response.status();
        // partial and interim replies leave the request in flight
        let is_final = !matches!(
            status,
            ResponseStatus::OkSoFar | ResponseStatus::Attn | ResponseStatus::WaitResp
        );
        if is_final {
            if let Some(info) = state.substreams.get_mut(usize::from(substream)) {
                info.outstanding = info.outstanding.saturating_sub(1);
            }
        }

        if status == ResponseStatus::Attn {
            return ReceivedAction::NoAction;
        }

        let sid = response.stream_id;
        if state.sids.is_timed_out(sid) {
            error!(
                stream = %state.stream_name,
                sid = ?sid,
                "response to a request that timed out, dropping it"
            );
            self.metrics.inc_stale_replies_discarded();
            // another reply follows a waitresp, keep the id reserved
            if status == ResponseStatus::WaitResp {
                return ReceivedAction::DigestMsg;
            }
            state.sids.release(sid);
            if state.sent_opens.remove(&sid) && status == ResponseStatus::Ok {
                return ReceivedAction::RequestClose;
            }
            return ReceivedAction::DigestMsg;
        }

        let delay = match &response.body {
            ResponseBody::Wait { seconds, .. } => Some(
                Duration::from_secs(u64::try_from(*seconds).unwrap_or(0))
                    + Duration::from_secs(self.config.wait_extra_secs),
            ),
            ResponseBody::WaitResp { seconds } => {
                Some(Duration::from_secs(u64::try_from(*seconds).unwrap_or(0)))
            }
            _ => None,
        };
        if let Some(delay) = delay {
            if state.raise_wait_barrier(now + delay) {
                debug!(
                    stream = %state.stream_name,
                    delay_secs = delay.as_secs(),
                    "setting up wait barrier"
                );
                self.metrics.inc_wait_barriers_raised();
            }
        }

        if state.sent_opens.contains(&sid) {
            if status == ResponseStatus::WaitResp {
                return ReceivedAction::NoAction;
            }
            state.sent_opens.remove(&sid);
            if status == ResponseStatus::Ok {
                state.open_files += 1;
            }
            return ReceivedAction::NoAction;
        }

        if state.sent_closes.contains(&sid) {
            if status == ResponseStatus::WaitResp {
                return ReceivedAction::NoAction;
            }
            state.sent_closes.remove(&sid);
            state.open_files = state.open_files.saturating_sub(1);
        }
        ReceivedAction::NoAction
    }

    /// Abandons an in-flight negotiation of `substream`.
    pub fn mark_broken(&self, substream: u16) {
        let mut state = self.lock();
        if let Some(info) = state.substreams.get_mut(usize::from(substream)) {
            info.status = StreamStatus::Broken;
        }
        if substream == 0 {
            state.auth = None;
            state.auth_epoch += 1;
        }
    }

    /// Resets `substream`; the primary also drops all per-session tracking.
    pub fn disconnect(&self, substream: u16) {
        let mut state = self.lock();
        if let Some(info) = state.substreams.get_mut(usize::from(substream)) {
            *info = StreamInfo::default();
        }
        if substream == 0 {
            state.sids.release_timed_out();
            state.sent_opens.clear();
            state.sent_closes.clear();
            state.open_files = 0;
            state.wait_barrier = None;
            state.auth = None;
            state.auth_epoch += 1;
        }
        self.metrics.inc_disconnects();
        debug!(stream = %state.stream_name, substream = substream, "sub-stream disconnected");
    }

/// Answers a [`ChannelQuery`].
    pub fn query(&self, query: ChannelQuery) -> QueryAnswer {
        let state = self.lock();
        match query {
            ChannelQuery::Name => QueryAnswer::Name("XRootD"),
            ChannelQuery::Auth => QueryAnswer::Auth(state.auth_mechanism.clone()),
            ChannelQuery::ServerFlags => QueryAnswer::ServerFlags(state.server_flags),
            ChannelQuery::ProtocolVersion => QueryAnswer::ProtocolVersion(state.protocol_version),
        }
    }

    /// Connected secondary sub-streams.
    pub fn connected_data_streams(&self) -> usize {
        self.lock()
            .substreams
            .iter()
            .skip(1)
            .filter(|s| s.status == StreamStatus::Connected)
            .count()
    }

    /// Sub-streams worth opening: one unless the peer is a data server.
    pub fn substream_count(&self) -> u16 {
        let state = self.lock();
        if !state.server_flags.is_data_server() {
            return 1;
        }
        u16::try_from(state.substreams.len()).unwrap_or(u16::MAX)
    }
}
