//! Connection handshake state machine.
//!
//! Every call to [`Channel::handshake_step`] consumes at most one inbound
//! message and yields at most one outbound message. The caller owns the
//! socket: it writes what the engine returns and feeds back what it reads.
//!
//! The primary sub-stream goes through handshake, protocol, login and
//! optionally auth and end-session. Parallel sub-streams do handshake and
//! protocol, then bind to the primary's session.

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Local, Offset};
use tracing::{debug, error, info, warn};

use crate::auth::{AuthEnv, AuthSession, AuthStep};
use crate::channel::{BindPreferences, Channel, ChannelState, StreamStatus};
use crate::codec::{
    decode_bind_response, decode_response, encode_request, server_flags_to_string,
    ClientRequest, LoginResponse, ProtocolResponse, RequestBody, ResponseBody, ServerHandshake,
    ServerResponse, SessionId,
};
use crate::error::{Result, TransportError};
use crate::message::Message;
use crate::protocol::{
    login_flags, protocol_flags, Expect, ResponseStatus, ServerFlags, CLIENT_PROTOCOL_VERSION,
    EMPTY_LOGIN_MAX_VERSION, ERR_NOT_FOUND, FLAGS_IN_PROTOCOL_VERSION,
};

/// Stream id used by all handshake traffic.
const HANDSHAKE_SID: [u8; 2] = [0, 0];

/// Inputs of one handshake step.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeContext<'a> {
/// Sub-stream being negotiated; 0 is the primary.
    pub substream: u16,
    /// Name used in log lines, e.g. `[host:1094.0]`.
    pub stream_name: &'a str,
    /// Local host name reported at login.
    pub client_name: &'a str,
/// Local socket address, reported to auth providers.
    pub local_addr: Option<SocketAddr>,
/// Server socket address, used to resolve providers.
    pub server_addr: Option<SocketAddr>,
    /// Reply to the previous outbound message, if one is expected.
    pub inbound: Option<&'a Message>,
}

impl<'a> HandshakeContext<'a> {
/// Context without an inbound message, as for the first step.
    pub fn new(substream: u16, stream_name: &'a str) -> Self {
        Self {
            substream,
            stream_name,
            client_name: "localhost",
            local_addr: None,
            server_addr: None,
            inbound: None,
        }
    }

/// Attaches the reply read since the previous step.
    pub fn with_inbound(mut self, inbound: &'a Message) -> Self {
        self.inbound = Some(inbound);
        self
    }
}

/// Outcome of one handshake step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Write this message, then read the reply.
    Send(Message),
    /// Nothing to write; read the next reply.
    AwaitReply,
/// The sub-stream is ready for requests.
    Connected,
}

fn handshake_failed(reason: impl Into<String>) -> TransportError {
    TransportError::HandShakeFailed {
        reason: reason.into(),
    }
}

fn login_failed(reason: impl Into<String>) -> TransportError {
    TransportError::LoginFailed {
        reason: reason.into(),
    }
}

fn require_inbound<'a>(ctx: &HandshakeContext<'a>) -> Result<&'a Message> {
    ctx.inbound.ok_or_else(|| TransportError::InvalidOp {
        reason: "a server reply is required at this handshake stage".to_string(),
    })
}

/// Extracts the `ok` payload, turning any other status into `err`.
fn ok_payload(rsp: ServerResponse, err: fn(String) -> TransportError) -> Result<Bytes> {
    match rsp.body {
        ResponseBody::Ok(data) => Ok(data),
        ResponseBody::Error { errnum, message } => {
            Err(err(format!("server error {}: {}", errnum, message)))
        }
        other => Err(err(format!("unexpected response: {:?}", status_of(&other)))),
    }
}

fn status_of(body: &ResponseBody) -> ResponseStatus {
    ServerResponse::new(HANDSHAKE_SID, body.clone()).status()
}

/// The 20 byte handshake followed by a protocol request.
pub fn initial_handshake(expect: Expect) -> Result<Message> {
    let mut buf = BytesMut::with_capacity(20);
    for word in [0i32, 0, 0, 4, 2012] {
        buf.put_i32(word);
    }
    let protocol = encode_request(&ClientRequest::new(
        HANDSHAKE_SID,
        RequestBody::Protocol {
            clientpv: CLIENT_PROTOCOL_VERSION,
            flags: protocol_flags::SECREQS | protocol_flags::BIFREQS,
            expect: expect as u8,
        },
    ))?;
    buf.put_slice(protocol.as_slice());
    let mut msg = Message::from_wire(&buf);
    msg.set_description("kXR_handshake + kXR_protocol");
    Ok(msg)
}

/// Two letter top level domain of `host`, `us` otherwise.
fn country_code(host: &str) -> String {
    match host.rsplit_once('.') {
        Some((_, tld)) if tld.len() == 2 && tld.chars().all(|c| c.is_ascii_alphabetic()) => {
            tld.to_ascii_lowercase()
        }
        _ => "us".to_string(),
    }
}

fn login_username(url_user: &str) -> [u8; 8] {
    let name = if !url_user.is_empty() {
        url_user.to_string()
    } else {
        std::env::var("USER")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| "_anon_".to_string())
    };
    let mut out = [0u8; 8];
    let n = name.len().min(out.len());
    out[..n].copy_from_slice(&name.as_bytes()[..n]);
    out
}

fn credtype(mechanism: &str) -> [u8; 4] {
    let mut out = [0u8; 4];
    let n = mechanism.len().min(out.len());
    out[..n].copy_from_slice(&mechanism.as_bytes()[..n]);
    out
}

fn auth_request(mechanism: &str, credentials: Bytes) -> Result<Message> {
    encode_request(&ClientRequest::new(
        HANDSHAKE_SID,
        RequestBody::Auth {
            credtype: credtype(mechanism),
            credentials,
        },
    ))
}

fn endsess_request(sessid: SessionId) -> Result<Message> {
    encode_request(&ClientRequest::new(HANDSHAKE_SID, RequestBody::Endsess { sessid }))
}

impl Channel {
    /// Advances the handshake of `ctx.substream` by one event.
    ///
    /// Errors other than `InvalidOp` leave the sub-stream `Broken`; a new
    /// attempt starts over from the initial handshake.
    pub fn handshake_step(&self, ctx: &HandshakeContext<'_>) -> Result<HandshakeStep> {
        let result = if ctx.substream == 0 {
            self.primary_step(ctx)
        } else {
            self.parallel_step(ctx)
        };

        if let Err(err) = &result {
            if !matches!(err, TransportError::InvalidOp { .. }) {
                self.mark_broken(ctx.substream);
                self.metrics().inc_handshakes_failed();
                error!(
                    stream = %ctx.stream_name,
                    code = err.code().as_str(),
                    "handshake failed: {}",
                    err
                );
            }
        }
        result
    }

    /// True once `substream` is connected.
    pub fn handshake_done(&self, substream: u16) -> bool {
        self.stream_status(substream) == Some(StreamStatus::Connected)
    }

    fn current_status(state: &ChannelState, substream: u16) -> Result<StreamStatus> {
        state
            .substreams
            .get(usize::from(substream))
            .map(|s| s.status)
            .ok_or_else(|| TransportError::Internal {
                reason: format!(
                    "sub-stream {} out of range ({} configured)",
                    substream,
                    state.substreams.len()
                ),
            })
    }

    fn set_status(state: &mut ChannelState, substream: u16, status: StreamStatus) {
        if let Some(info) = state.substreams.get_mut(usize::from(substream)) {
            info.status = status;
        }
    }

    fn primary_step(&self, ctx: &HandshakeContext<'_>) -> Result<HandshakeStep> {
        let mut state = self.lock();
        match Self::current_status(&state, 0)? {
            StreamStatus::Disconnected | StreamStatus::Broken => {
                if !ctx.stream_name.is_empty() {
                    state.stream_name = ctx.stream_name.to_string();
                }
                let msg = initial_handshake(Expect::Login)?;
                Self::set_status(&mut state, 0, StreamStatus::HandshakeSent);
                self.metrics().inc_handshakes_started();
                debug!(stream = %ctx.stream_name, "sending out the initial hand shake");
                Ok(HandshakeStep::Send(msg))
            }
            StreamStatus::HandshakeSent => {
                let hs = ServerHandshake::decode(require_inbound(ctx)?.as_slice())?;
                if hs.status != ResponseStatus::Ok {
                    return Err(handshake_failed(format!(
                        "invalid hand shake response status: {:?}",
                        hs.status
                    )));
                }
                state.protocol_version = hs.protover;
                state.server_flags = hs.server_flags();
                debug!(
                    stream = %ctx.stream_name,
                    protocol = format_args!("{:#x}", hs.protover),
                    flags = %server_flags_to_string(state.server_flags),
                    "got the server hand shake response"
                );
                Self::set_status(&mut state, 0, StreamStatus::HandshakeReceived);
                Ok(HandshakeStep::AwaitReply)
            }
            StreamStatus::HandshakeReceived => {
                let rsp = decode_response(require_inbound(ctx)?.as_slice())?;
                let data = ok_payload(rsp, |r| handshake_failed(format!("kXR_protocol: {}", r)))?;
                let protocol = ProtocolResponse::decode(&data)?;
                if state.protocol_version >= FLAGS_IN_PROTOCOL_VERSION {
                    state.server_flags = ServerFlags::from_bits(protocol.flags);
                }
                state.bind_prefs = BindPreferences::new(protocol.bind_prefs.clone());
                debug!(
                    stream = %ctx.stream_name,
                    flags = %server_flags_to_string(state.server_flags),
                    "kXR_protocol successful"
                );
                let msg = self.login_request(ctx)?;
                Self::set_status(&mut state, 0, StreamStatus::LoginSent);
                Ok(HandshakeStep::Send(msg))
            }
            StreamStatus::LoginSent => {
                let rsp = decode_response(require_inbound(ctx)?.as_slice())?;
                let data = ok_payload(rsp, |r| login_failed(r))?;
                if !state.first_login {
                    state.old_session_id = state.session_id;
                }
                if data.is_empty() && state.protocol_version <= EMPTY_LOGIN_MAX_VERSION {
                    state.session_id = [0; 16];
                    warn!(stream = %ctx.stream_name, "logged in, accepting empty login response");
                    return self.finish_login(&mut state, ctx);
                }
                let login = LoginResponse::decode(&data)?;
                state.session_id = login.session_id;
                debug!(stream = %ctx.stream_name, "logged in");
                if login.security.is_empty() {
                    return self.finish_login(&mut state, ctx);
                }

                debug!(stream = %ctx.stream_name, "authentication is required");
                let env = AuthEnv::for_login(
                    &ctx.local_addr.map(|a| a.to_string()).unwrap_or_default(),
                    &self.url().username,
                    &self.url().password,
                    &self.url().params,
                );
                let mut session = AuthSession::new(
                    ctx.stream_name,
                    &self.url().host,
                    ctx.server_addr,
                    login.security,
                    env,
                );
                let epoch = state.auth_epoch;
                drop(state);

                let step = session.start(self.registry());
                self.after_auth_round(ctx, epoch, session, step)
            }
            StreamStatus::AuthSent => {
                let rsp = decode_response(require_inbound(ctx)?.as_slice())?;
                let mut session = state.auth.take().ok_or_else(|| TransportError::Internal {
                    reason: "authentication reply without a negotiation in progress".to_string(),
                })?;
                let epoch = state.auth_epoch;
                drop(state);

                if rsp.status() == ResponseStatus::Error {
                    self.metrics().inc_auth_rejections();
                }
                let step = session.handle_reply(&rsp, self.registry());
                self.after_auth_round(ctx, epoch, session, step)
            }
            StreamStatus::EndSessionSent => {
                let rsp = decode_response(require_inbound(ctx)?.as_slice())?;
                match rsp.body {
                    ResponseBody::Ok(_) => {}
                    ResponseBody::Error { errnum, .. } if errnum == ERR_NOT_FOUND => {}
                    ResponseBody::Wait { seconds, .. } => {
                        debug!(
                            stream = %ctx.stream_name,
                            seconds = seconds,
                            "server asked to wait, re-sending kXR_endsess"
                        );
                        return Ok(HandshakeStep::Send(endsess_request(state.old_session_id)?));
                    }
                    ResponseBody::Error { errnum, message } => {
                        return Err(handshake_failed(format!(
                            "kXR_endsess failed with {}: {}",
                            errnum, message
                        )));
                    }
                    other => {
                        return Err(TransportError::DataError {
                            reason: format!(
                                "unexpected kXR_endsess response: {:?}",
                                status_of(&other)
                            ),
                        });
                    }
                }
                Self::set_status(&mut state, 0, StreamStatus::Connected);
                self.metrics().inc_handshakes_completed();
                info!(stream = %ctx.stream_name, "previous session ended, connected");
                Ok(HandshakeStep::Connected)
            }
            StreamStatus::Connected => Ok(HandshakeStep::Connected),
            StreamStatus::BindSent => Err(TransportError::Internal {
                reason: "primary sub-stream cannot be in bind state".to_string(),
            }),
        }
    }

    /// Stores the session back and turns an auth step into a handshake step.
    ///
    /// `epoch` is the primary's reset counter when the lock was released. If
    /// the stream was broken or disconnected meanwhile, the round is dropped
    /// and the state is left as the reset made it.
    fn after_auth_round(
        &self,
        ctx: &HandshakeContext<'_>,
        epoch: u64,
        session: AuthSession,
        step: Result<AuthStep>,
    ) -> Result<HandshakeStep> {
        let mut state = self.lock();
        if state.auth_epoch != epoch {
            drop(session);
            warn!(
                stream = %ctx.stream_name,
                "sub-stream was reset during authentication, dropping the round"
            );
            return Err(TransportError::InvalidOp {
                reason: "sub-stream was reset during authentication".to_string(),
            });
        }
        match step? {
            AuthStep::Send {
                mechanism,
                credentials,
            } => {
                self.metrics().inc_auth_attempts();
                let msg = auth_request(&mechanism, credentials)?;
                state.auth = Some(session);
                Self::set_status(&mut state, 0, StreamStatus::AuthSent);
                Ok(HandshakeStep::Send(msg))
            }
            AuthStep::Accepted { mechanism } => {
                info!(
                    stream = %ctx.stream_name,
                    mechanism = %mechanism,
                    "authenticated"
                );
                state.auth_mechanism = mechanism;
                self.finish_login(&mut state, ctx)
            }
        }
    }

    /// Connects, or ends the previous session first on a re-login.
    fn finish_login(
        &self,
        state: &mut ChannelState,
        ctx: &HandshakeContext<'_>,
    ) -> Result<HandshakeStep> {
        if !state.first_login {
            let msg = endsess_request(state.old_session_id)?;
            Self::set_status(state, 0, StreamStatus::EndSessionSent);
            debug!(stream = %ctx.stream_name, "ending the previous session");
            return Ok(HandshakeStep::Send(msg));
        }
        state.first_login = false;
        Self::set_status(state, 0, StreamStatus::Connected);
        self.metrics().inc_handshakes_completed();
        info!(stream = %ctx.stream_name, "connected");
        Ok(HandshakeStep::Connected)
    }

    fn login_request(&self, ctx: &HandshakeContext<'_>) -> Result<Message> {
        let config = self.config();
        let tz_hours = Local::now().offset().fix().local_minus_utc() / 3600;
        let mut cgi = format!(
            "xrd.cc={}&xrd.tz={}&xrd.appname={}&xrd.info={}&xrd.hostname={}&xrd.rn=v{}",
            country_code(ctx.client_name),
            tz_hours,
            config.app_name,
            config.mon_info,
            ctx.client_name,
            env!("CARGO_PKG_VERSION"),
        );
        if !self.url().login_token.is_empty() {
            cgi.push('&');
            cgi.push_str(&self.url().login_token);
        }

        let mut ability = login_flags::FULLURL
            | login_flags::READRDOK
            | login_flags::LCLFILE
            | login_flags::REDIRFLAGS;
        if config.multi_protocol {
            ability |= login_flags::MULTIPR;
        }

        let mut msg = encode_request(&ClientRequest::new(
            HANDSHAKE_SID,
            RequestBody::Login {
                pid: std::process::id(),
                username: login_username(&self.url().username),
                ability2: 0,
                ability,
                capver: login_flags::ASYNCAP | login_flags::VER005,
                cgi: Bytes::from(cgi),
            },
        ))?;
        msg.set_description("kXR_login");
        Ok(msg)
    }

    fn parallel_step(&self, ctx: &HandshakeContext<'_>) -> Result<HandshakeStep> {
        let sub = ctx.substream;
        let mut state = self.lock();
        let status = Self::current_status(&state, sub)?;
        match status {
            StreamStatus::Disconnected | StreamStatus::Broken => {
                if state.substreams[0].status != StreamStatus::Connected {
                    return Err(TransportError::InvalidOp {
                        reason: format!(
                            "sub-stream {} cannot start before the primary is connected",
                            sub
                        ),
                    });
                }
                let msg = initial_handshake(Expect::Bind)?;
                Self::set_status(&mut state, sub, StreamStatus::HandshakeSent);
                self.metrics().inc_handshakes_started();
                debug!(stream = %ctx.stream_name, "sending out the initial hand shake");
                Ok(HandshakeStep::Send(msg))
            }
            StreamStatus::HandshakeSent => {
                let hs = ServerHandshake::decode(require_inbound(ctx)?.as_slice())?;
                if hs.status != ResponseStatus::Ok {
                    return Err(handshake_failed(format!(
                        "invalid hand shake response status: {:?}",
                        hs.status
                    )));
                }
                if hs.server_flags().role() != state.server_flags.role() {
                    return Err(handshake_failed(format!(
                        "server role changed: primary is {}, sub-stream {} reports {}",
                        state.server_flags,
                        sub,
                        hs.server_flags()
                    )));
                }
                Self::set_status(&mut state, sub, StreamStatus::HandshakeReceived);
                Ok(HandshakeStep::AwaitReply)
            }
            StreamStatus::HandshakeReceived => {
                let rsp = decode_response(require_inbound(ctx)?.as_slice())?;
                let data = ok_payload(rsp, |r| handshake_failed(format!("kXR_protocol: {}", r)))?;
                ProtocolResponse::decode(&data)?;
                let mut msg = encode_request(&ClientRequest::new(
                    HANDSHAKE_SID,
                    RequestBody::Bind {
                        sessid: state.session_id,
                    },
                ))?;
                msg.set_description("kXR_bind");
                Self::set_status(&mut state, sub, StreamStatus::BindSent);
                Ok(HandshakeStep::Send(msg))
            }
            StreamStatus::BindSent => {
                let rsp = decode_response(require_inbound(ctx)?.as_slice())?;
                let data = ok_payload(rsp, |r| login_failed(format!("kXR_bind: {}", r)))?;
                let path_id = decode_bind_response(&data)?;
                if let Some(info) = state.substreams.get_mut(usize::from(sub)) {
                    info.path_id = path_id;
                    info.status = StreamStatus::Connected;
                }
                self.metrics().inc_binds_completed();
                self.metrics().inc_handshakes_completed();
                debug!(stream = %ctx.stream_name, path_id = path_id, "bound to the session");
                Ok(HandshakeStep::Connected)
            }
            StreamStatus::Connected => Ok(HandshakeStep::Connected),
            other => Err(TransportError::Internal {
                reason: format!("sub-stream {} in unexpected state {:?}", sub, other),
            }),
        }
    }
}
