//! Protocol constants for the root wire protocol.
//!
//! Request ids, response status codes, server role flags and the fixed sizes
//! of the framing. All multi-byte values travel in network byte order.

use std::fmt;

/// Client request header size (streamid:2 + requestid:2 + body:16 + dlen:4).
pub const REQUEST_HEADER_SIZE: usize = 24;

/// Server response header size (streamid:2 + status:2 + dlen:4).
pub const RESPONSE_HEADER_SIZE: usize = 8;

/// Size of the client initial handshake preceding the first protocol request.
pub const CLIENT_HANDSHAKE_SIZE: usize = 20;

/// Size of the server reply to the initial handshake.
pub const SERVER_HANDSHAKE_SIZE: usize = 16;

/// Length of the session id issued at login.
pub const SESSION_ID_SIZE: usize = 16;

/// Largest body the client accepts in a single response.
pub const MAX_BODY_SIZE: u32 = 256 * 1024 * 1024;

/// Protocol version announced by this client (5.1.0).
pub const CLIENT_PROTOCOL_VERSION: u32 = 0x0000_0511;

/// Servers at or above this version report their role in the protocol response.
pub const FLAGS_IN_PROTOCOL_VERSION: u32 = 0x0000_0297;

/// Servers at or below this version may answer a login with an empty body.
pub const EMPTY_LOGIN_MAX_VERSION: u32 = 0x0000_0289;

/// `msgval` of the server handshake when talking to a data server.
pub const HANDSHAKE_DATA_SERVER: u32 = 1;

/// Size of a readv/writev chunk descriptor (fhandle:4 + len:4 + offset:8).
pub const CHUNK_SIZE: usize = 16;

/// Size of the optional read arguments (pathid:1 + reserved:7).
pub const READ_ARGS_SIZE: usize = 8;

/// Size of the optional pgread arguments (pathid:1 + reqflags:1).
pub const PGREAD_ARGS_SIZE: usize = 2;

/// Error number the server uses for "not found".
pub const ERR_NOT_FOUND: u32 = 3011;

/// Attention action wrapping an asynchronous response.
pub const ATTN_ASYNRESP: u32 = 5008;

/// Attention action carrying a server message.
pub const ATTN_ASYNCMS: u32 = 5002;

/// Client request codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RequestId {
    /// kXR_auth.
    Auth = 3000,
    /// kXR_query.
    Query = 3001,
    /// kXR_chmod.
    Chmod = 3002,
    /// kXR_close.
    Close = 3003,
    /// kXR_dirlist.
    Dirlist = 3004,
    /// kXR_protocol.
    Protocol = 3006,
    /// kXR_login.
    Login = 3007,
    /// kXR_mkdir.
    Mkdir = 3008,
    /// kXR_mv.
    Mv = 3009,
    /// kXR_open.
    Open = 3010,
    /// kXR_ping.
    Ping = 3011,
    /// kXR_read.
    Read = 3013,
    /// kXR_rm.
    Rm = 3014,
    /// kXR_rmdir.
    Rmdir = 3015,
    /// kXR_sync.
    Sync = 3016,
    /// kXR_stat.
    Stat = 3017,
    /// kXR_write.
    Write = 3019,
    /// kXR_prepare.
    Prepare = 3021,
    /// kXR_endsess.
    Endsess = 3023,
    /// kXR_bind.
    Bind = 3024,
    /// kXR_readv.
    Readv = 3025,
    /// kXR_pgwrite.
    Pgwrite = 3026,
    /// kXR_locate.
    Locate = 3027,
    /// kXR_truncate.
    Truncate = 3028,
    /// kXR_pgread.
    Pgread = 3030,
    /// kXR_writev.
    Writev = 3031,
}

impl RequestId {
    /// Maps a raw request code onto a known request, if any.
    pub fn from_u16(raw: u16) -> Option<Self> {
        let id = match raw {
            3000 => RequestId::Auth,
            3001 => RequestId::Query,
            3002 => RequestId::Chmod,
            3003 => RequestId::Close,
            3004 => RequestId::Dirlist,
            3006 => RequestId::Protocol,
            3007 => RequestId::Login,
            3008 => RequestId::Mkdir,
            3009 => RequestId::Mv,
            3010 => RequestId::Open,
            3011 => RequestId::Ping,
            3013 => RequestId::Read,
            3014 => RequestId::Rm,
            3015 => RequestId::Rmdir,
            3016 => RequestId::Sync,
            3017 => RequestId::Stat,
            3019 => RequestId::Write,
            3021 => RequestId::Prepare,
            3023 => RequestId::Endsess,
            3024 => RequestId::Bind,
            3025 => RequestId::Readv,
            3026 => RequestId::Pgwrite,
            3027 => RequestId::Locate,
            3028 => RequestId::Truncate,
            3030 => RequestId::Pgread,
            3031 => RequestId::Writev,
            _ => return None,
        };
        Some(id)
    }

    /// Raw wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Protocol name of the request, as it appears in logs.
    pub fn name(self) -> &'static str {
        match self {
            RequestId::Auth => "kXR_auth",
            RequestId::Query => "kXR_query",
            RequestId::Chmod => "kXR_chmod",
            RequestId::Close => "kXR_close",
            RequestId::Dirlist => "kXR_dirlist",
            RequestId::Protocol => "kXR_protocol",
            RequestId::Login => "kXR_login",
            RequestId::Mkdir => "kXR_mkdir",
            RequestId::Mv => "kXR_mv",
            RequestId::Open => "kXR_open",
            RequestId::Ping => "kXR_ping",
            RequestId::Read => "kXR_read",
            RequestId::Rm => "kXR_rm",
            RequestId::Rmdir => "kXR_rmdir",
            RequestId::Sync => "kXR_sync",
            RequestId::Stat => "kXR_stat",
            RequestId::Write => "kXR_write",
            RequestId::Prepare => "kXR_prepare",
            RequestId::Endsess => "kXR_endsess",
            RequestId::Bind => "kXR_bind",
            RequestId::Readv => "kXR_readv",
            RequestId::Pgwrite => "kXR_pgwrite",
            RequestId::Locate => "kXR_locate",
            RequestId::Truncate => "kXR_truncate",
            RequestId::Pgread => "kXR_pgread",
            RequestId::Writev => "kXR_writev",
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Server response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    /// kXR_ok.
    Ok,
    /// kXR_oksofar.
    OkSoFar,
    /// kXR_attn.
    Attn,
    /// kXR_authmore.
    AuthMore,
    /// kXR_error.
    Error,
    /// kXR_redirect.
    Redirect,
    /// kXR_wait.
    Wait,
    /// kXR_waitresp.
    WaitResp,
    /// kXR_status.
    Status,
    /// Status value this client does not know.
    Other(u16),
}

impl ResponseStatus {
    /// Maps a raw status code.
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0 => ResponseStatus::Ok,
            4000 => ResponseStatus::OkSoFar,
            4001 => ResponseStatus::Attn,
            4002 => ResponseStatus::AuthMore,
            4003 => ResponseStatus::Error,
            4004 => ResponseStatus::Redirect,
            4005 => ResponseStatus::Wait,
            4006 => ResponseStatus::WaitResp,
            4007 => ResponseStatus::Status,
            other => ResponseStatus::Other(other),
        }
    }

    /// Raw wire value.
    pub fn as_u16(self) -> u16 {
        match self {
            ResponseStatus::Ok => 0,
            ResponseStatus::OkSoFar => 4000,
            ResponseStatus::Attn => 4001,
            ResponseStatus::AuthMore => 4002,
            ResponseStatus::Error => 4003,
            ResponseStatus::Redirect => 4004,
            ResponseStatus::Wait => 4005,
            ResponseStatus::WaitResp => 4006,
            ResponseStatus::Status => 4007,
            ResponseStatus::Other(raw) => raw,
        }
    }
}

/// Flags of the protocol request.
pub mod protocol_flags {
    /// Ask the server to return its security requirements.
    pub const SECREQS: u8 = 0x01;
    /// Client is able to speak TLS.
    pub const ABLE_TLS: u8 = 0x02;
    /// Client wants the connection switched to TLS.
    pub const WANT_TLS: u8 = 0x04;
    /// Ask the server to return bind interface preferences.
    pub const BIFREQS: u8 = 0x08;
}

/// What the client intends to do after the protocol request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Expect {
/// Protocol information only.
    None = 0x00,
/// A bind follows.
    Bind = 0x01,
/// A login follows.
    Login = 0x03,
}

/// Login capability and ability bits.
pub mod login_flags {
    /// Client understands asynchronous responses.
    pub const ASYNCAP: u8 = 0x80;
    /// Client generation with TLS support.
    pub const VER005: u8 = 5;
/// Client accepts full URLs in redirects.
    pub const FULLURL: u8 = 1;
/// Client supports multiple protocols.
    pub const MULTIPR: u8 = 3;
/// Client may be redirected on reads.
    pub const READRDOK: u8 = 4;
/// Client can handle local file redirects.
    pub const LCLFILE: u8 = 64;
/// Client understands redirect flags.
    pub const REDIRFLAGS: u8 = 128;
}

/// Role and attribute bits reported by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ServerFlags(u32);

impl ServerFlags {
/// Data server.
    pub const IS_SERVER: u32 = 0x0000_0001;
/// Manager (redirector).
    pub const IS_MANAGER: u32 = 0x0000_0002;
/// Meta manager.
    pub const ATTR_META: u32 = 0x0000_0100;
/// Proxy server.
    pub const ATTR_PROXY: u32 = 0x0000_0200;
/// Supervisor.
    pub const ATTR_SUPER: u32 = 0x0000_0400;

    /// Flags from their raw wire representation.
    pub fn from_bits(bits: u32) -> Self {
        ServerFlags(bits)
    }

    /// Flags implied by the `msgval` of a server handshake.
    pub fn from_handshake(msgval: u32) -> Self {
        if msgval == HANDSHAKE_DATA_SERVER {
            ServerFlags(Self::IS_SERVER)
        } else {
            ServerFlags(Self::IS_MANAGER)
        }
    }

    /// Raw representation.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// True when the peer is a data server.
    pub fn is_data_server(&self) -> bool {
        self.0 & Self::IS_SERVER != 0
    }

    /// True when the peer is a redirector.
    pub fn is_manager(&self) -> bool {
        self.0 & Self::IS_MANAGER != 0
    }

    /// Role bits only, used to compare a parallel stream against the primary.
    pub fn role(&self) -> u32 {
        self.0 & (Self::IS_SERVER | Self::IS_MANAGER)
    }
}

impl fmt::Display for ServerFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_manager() {
            "manager "
        } else if self.is_data_server() {
            "server "
        } else {
            ""
        };
        let attr = if self.0 & Self::ATTR_META != 0 {
            "meta"
        } else if self.0 & Self::ATTR_PROXY != 0 {
            "proxy"
        } else if self.0 & Self::ATTR_SUPER != 0 {
            "super"
        } else {
            ""
        };
        write!(f, "type: {}[{}]", kind, attr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_roundtrip() {
        for raw in 2990u16..3040 {
            if let Some(id) = RequestId::from_u16(raw) {
                assert_eq!(id.as_u16(), raw);
            }
        }
        assert_eq!(RequestId::from_u16(3005), None);
        assert_eq!(RequestId::Read.name(), "kXR_read");
    }

    #[test]
    fn test_response_status_mapping() {
        assert_eq!(ResponseStatus::from_u16(0), ResponseStatus::Ok);
        assert_eq!(ResponseStatus::from_u16(4002), ResponseStatus::AuthMore);
        assert_eq!(ResponseStatus::from_u16(4242), ResponseStatus::Other(4242));
        assert_eq!(ResponseStatus::WaitResp.as_u16(), 4006);
    }

    #[test]
    fn test_server_flags_display() {
        let flags = ServerFlags::from_bits(ServerFlags::IS_SERVER | ServerFlags::ATTR_PROXY);
        assert!(flags.is_data_server());
        assert_eq!(flags.to_string(), "type: server [proxy]");

        let flags = ServerFlags::from_handshake(0);
        assert!(flags.is_manager());
        assert!(!flags.is_data_server());
        assert_eq!(flags.to_string(), "type: manager []");
    }
}
