//! Big-endian wire codec for client requests and server responses.
//!
//! Requests are a 24 byte header (`streamid[2] requestid:u16 body[16]
//! dlen:u32`) followed by `dlen` bytes of data. Responses are an 8 byte
//! header (`streamid[2] status:u16 dlen:u32`) followed by the body.
//!
//! Every request has a typed host representation, [`ClientRequest`], and
//! `decode_request(encode_request(x)) == x` holds for all of them. Unknown
//! request ids travel as [`RequestBody::Opaque`] and are never interpreted.

use std::fmt::Write as _;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};
use crate::message::Message;
use crate::protocol::{
    RequestId, ResponseStatus, ServerFlags, ATTN_ASYNRESP, CHUNK_SIZE, MAX_BODY_SIZE,
    PGREAD_ARGS_SIZE, READ_ARGS_SIZE, REQUEST_HEADER_SIZE, RESPONSE_HEADER_SIZE,
    SERVER_HANDSHAKE_SIZE, SESSION_ID_SIZE,
};

/// Correlation id of a request, echoed by the server in its response.
pub type StreamId = [u8; 2];

/// Opaque server-side file handle.
pub type FileHandle = [u8; 4];

/// Session id issued at login.
pub type SessionId = [u8; SESSION_ID_SIZE];

/// One element of a vectored read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadChunk {
    /// File to read from.
    pub fhandle: FileHandle,
    /// Bytes to read.
    pub rlen: i32,
    /// Offset into the file.
    pub offset: i64,
}

/// One element of a vectored write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteChunk {
    /// File to write to.
    pub fhandle: FileHandle,
    /// Bytes of data belonging to this chunk.
    pub wlen: i32,
    /// Offset into the file.
    pub offset: i64,
}

/// Optional trailing arguments of a read request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadArgs {
    /// Sub-stream the response should come back on.
    pub path_id: u8,
    /// Pre-read list following the fixed arguments, kept verbatim.
    pub trailer: Bytes,
}

/// Optional trailing arguments of a page read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PgReadArgs {
    /// Sub-stream the response should come back on.
    pub path_id: u8,
    /// Page read flags.
    pub reqflags: u8,
}

/// Request specific part of a client request.
///
/// Fields follow the wire layout of each request; `path`, `args` and `data`
/// hold the variable length part that follows the 24 byte header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// kXR_auth.
    Auth {
        /// Mechanism name, zero padded.
        credtype: [u8; 4],
        /// Provider generated credentials.
        credentials: Bytes,
    },
    /// kXR_query.
    Query {
        /// What is being queried.
        infotype: u16,
        /// File the query refers to, if any.
        fhandle: FileHandle,
        /// Query arguments.
        args: Bytes,
    },
    /// kXR_chmod.
    Chmod {
        /// New access mode.
        mode: u16,
        /// Target path.
        path: Bytes,
    },
    /// kXR_close.
    Close {
        /// File to close.
        fhandle: FileHandle,
    },
    /// kXR_dirlist.
    Dirlist {
        /// Listing options.
        options: u8,
        /// Directory path.
        path: Bytes,
    },
    /// kXR_protocol.
    Protocol {
        /// Client protocol version.
        clientpv: u32,
        /// Requested protocol features.
        flags: u8,
        /// What follows: login or bind.
        expect: u8,
    },
    /// kXR_login.
    Login {
        /// Client process id.
        pid: u32,
        /// User name, zero padded.
        username: [u8; 8],
        /// Extended abilities.
        ability2: u8,
        /// Client abilities.
        ability: u8,
        /// Capabilities and protocol level.
        capver: u8,
        /// Login CGI string.
        cgi: Bytes,
    },
    /// kXR_mkdir.
    Mkdir {
        /// Creation options.
        options: u8,
        /// Access mode of the new directory.
        mode: u16,
        /// Directory path.
        path: Bytes,
    },
    /// kXR_mv.
    Mv {
        /// Length of the source path within `args`.
        arg1len: i16,
        /// Source and destination, space separated.
        args: Bytes,
    },
    /// kXR_open.
    Open {
        /// Access mode for created files.
        mode: u16,
        /// Open options.
        options: u16,
        /// File path with optional CGI.
        path: Bytes,
    },
    /// kXR_ping.
    Ping,
    /// kXR_read.
    Read {
        /// File to read from.
        fhandle: FileHandle,
        /// Offset into the file.
        offset: i64,
        /// Bytes to read.
        rlen: i32,
        /// Optional path id and pre-read list.
        args: Option<ReadArgs>,
    },
    /// kXR_rm.
    Rm {
        /// File path.
        path: Bytes,
    },
    /// kXR_rmdir.
    Rmdir {
        /// Directory path.
        path: Bytes,
    },
    /// kXR_sync.
    Sync {
        /// File to sync.
        fhandle: FileHandle,
    },
    /// kXR_stat.
    Stat {
        /// Stat options.
        options: u8,
        /// File to stat when `path` is empty.
        fhandle: FileHandle,
        /// Path to stat.
        path: Bytes,
    },
    /// kXR_write.
    Write {
        /// File to write to.
        fhandle: FileHandle,
        /// Offset into the file.
        offset: i64,
        /// Sub-stream carrying the data.
        path_id: u8,
        /// Payload.
        data: Bytes,
    },
    /// kXR_prepare.
    Prepare {
        /// Prepare options.
        options: u8,
        /// Priority.
        prty: u8,
        /// Notification port.
        port: u16,
        /// Extended options.
        option_x: u16,
        /// Newline separated paths.
        paths: Bytes,
    },
    /// kXR_endsess.
    Endsess {
        /// Session to end.
        sessid: SessionId,
    },
    /// kXR_bind.
    Bind {
        /// Session of the primary sub-stream.
        sessid: SessionId,
    },
    /// kXR_readv.
    Readv {
        /// Sub-stream the response should come back on.
        path_id: u8,
        /// Read list.
        chunks: Vec<ReadChunk>,
    },
    /// kXR_pgwrite.
    Pgwrite {
        /// File to write to.
        fhandle: FileHandle,
        /// Offset into the file.
        offset: i64,
        /// Sub-stream carrying the data.
        path_id: u8,
        /// Page write flags.
        reqflags: u8,
        /// Pages with their checksums.
        data: Bytes,
    },
    /// kXR_locate.
    Locate {
        /// Locate options.
        options: u16,
        /// Path to locate.
        path: Bytes,
    },
    /// kXR_truncate.
    Truncate {
        /// File to truncate when `path` is empty.
        fhandle: FileHandle,
        /// New size.
        offset: i64,
        /// Path to truncate.
        path: Bytes,
    },
    /// kXR_pgread.
    Pgread {
        /// File to read from.
        fhandle: FileHandle,
        /// Offset into the file.
        offset: i64,
        /// Bytes to read.
        rlen: i32,
        /// Optional path id and flags.
        args: Option<PgReadArgs>,
    },
    /// kXR_writev.
    Writev {
        /// Write options.
        options: u8,
        /// Write list; the data follows the list on the wire.
        chunks: Vec<WriteChunk>,
    },
    /// Request id this codec has no field table for.
    Opaque {
        /// Raw request id.
        request_id: u16,
        /// The 16 byte request specific header, verbatim.
        header: [u8; 16],
        /// Payload, verbatim.
        data: Bytes,
    },
}

impl RequestBody {
    /// Raw request id of this body.
    pub fn request_id(&self) -> u16 {
        let id = match self {
            RequestBody::Auth { .. } => RequestId::Auth,
            RequestBody::Query { .. } => RequestId::Query,
            RequestBody::Chmod { .. } => RequestId::Chmod,
            RequestBody::Close { .. } => RequestId::Close,
            RequestBody::Dirlist { .. } => RequestId::Dirlist,
            RequestBody::Protocol { .. } => RequestId::Protocol,
            RequestBody::Login { .. } => RequestId::Login,
            RequestBody::Mkdir { .. } => RequestId::Mkdir,
            RequestBody::Mv { .. } => RequestId::Mv,
            RequestBody::Open { .. } => RequestId::Open,
            RequestBody::Ping => RequestId::Ping,
            RequestBody::Read { .. } => RequestId::Read,
            RequestBody::Rm { .. } => RequestId::Rm,
            RequestBody::Rmdir { .. } => RequestId::Rmdir,
            RequestBody::Sync { .. } => RequestId::Sync,
            RequestBody::Stat { .. } => RequestId::Stat,
            RequestBody::Write { .. } => RequestId::Write,
            RequestBody::Prepare { .. } => RequestId::Prepare,
            RequestBody::Endsess { .. } => RequestId::Endsess,
            RequestBody::Bind { .. } => RequestId::Bind,
            RequestBody::Readv { .. } => RequestId::Readv,
            RequestBody::Pgwrite { .. } => RequestId::Pgwrite,
            RequestBody::Locate { .. } => RequestId::Locate,
            RequestBody::Truncate { .. } => RequestId::Truncate,
            RequestBody::Pgread { .. } => RequestId::Pgread,
            RequestBody::Writev { .. } => RequestId::Writev,
            RequestBody::Opaque { request_id, .. } => return *request_id,
        };
        id.as_u16()
    }
}

/// A client request in host representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    /// Correlation id echoed by the response.
    pub stream_id: StreamId,
    /// Request id and its fields.
    pub body: RequestBody,
}

impl ClientRequest {
    /// Pairs a body with its stream id.
    pub fn new(stream_id: StreamId, body: RequestBody) -> Self {
        Self { stream_id, body }
    }

    /// Known request id, `None` for opaque requests.
    pub fn request_id(&self) -> Option<RequestId> {
        RequestId::from_u16(self.body.request_id())
    }
}

fn put_reserved(buf: &mut BytesMut, n: usize) {
    buf.put_bytes(0, n);
}

fn put_chunk(buf: &mut BytesMut, fhandle: &FileHandle, len: i32, offset: i64) {
    buf.put_slice(fhandle);
    buf.put_i32(len);
    buf.put_i64(offset);
}

/// Marshals a request into its wire form.
pub fn encode_request(req: &ClientRequest) -> Result<Message> {
    let mut body = BytesMut::with_capacity(16);
    let mut data = BytesMut::new();

    match &req.body {
        RequestBody::Auth {
            credtype,
            credentials,
        } => {
            put_reserved(&mut body, 12);
            body.put_slice(credtype);
            data.put_slice(credentials);
        }
        RequestBody::Query {
            infotype,
            fhandle,
            args,
        } => {
            body.put_u16(*infotype);
            put_reserved(&mut body, 2);
            body.put_slice(fhandle);
            put_reserved(&mut body, 8);
            data.put_slice(args);
        }
        RequestBody::Chmod { mode, path } => {
            put_reserved(&mut body, 14);
            body.put_u16(*mode);
            data.put_slice(path);
        }
        RequestBody::Close { fhandle } | RequestBody::Sync { fhandle } => {
            body.put_slice(fhandle);
            put_reserved(&mut body, 12);
        }
        RequestBody::Dirlist { options, path } => {
            put_reserved(&mut body, 15);
            body.put_u8(*options);
            data.put_slice(path);
        }
        RequestBody::Protocol {
            clientpv,
            flags,
            expect,
        } => {
            body.put_u32(*clientpv);
            body.put_u8(*flags);
            body.put_u8(*expect);
            put_reserved(&mut body, 10);
        }
        RequestBody::Login {
            pid,
            username,
            ability2,
            ability,
            capver,
            cgi,
        } => {
            body.put_u32(*pid);
            body.put_slice(username);
            body.put_u8(*ability2);
            body.put_u8(*ability);
            body.put_u8(*capver);
            put_reserved(&mut body, 1);
            data.put_slice(cgi);
        }
        RequestBody::Mkdir {
            options,
            mode,
            path,
        } => {
            body.put_u8(*options);
            put_reserved(&mut body, 13);
            body.put_u16(*mode);
            data.put_slice(path);
        }
        RequestBody::Mv { arg1len, args } => {
            put_reserved(&mut body, 14);
            body.put_i16(*arg1len);
            data.put_slice(args);
        }
        RequestBody::Open {
            mode,
            options,
            path,
        } => {
            body.put_u16(*mode);
            body.put_u16(*options);
            put_reserved(&mut body, 12);
            data.put_slice(path);
        }
        RequestBody::Ping => put_reserved(&mut body, 16),
        RequestBody::Read {
            fhandle,
            offset,
            rlen,
            args,
        } => {
            body.put_slice(fhandle);
            body.put_i64(*offset);
            body.put_i32(*rlen);
            if let Some(args) = args {
                data.put_u8(args.path_id);
                put_reserved(&mut data, READ_ARGS_SIZE - 1);
                data.put_slice(&args.trailer);
            }
        }
        RequestBody::Rm { path } | RequestBody::Rmdir { path } => {
            put_reserved(&mut body, 16);
            data.put_slice(path);
        }
        RequestBody::Stat {
            options,
            fhandle,
            path,
        } => {
            body.put_u8(*options);
            put_reserved(&mut body, 11);
            body.put_slice(fhandle);
            data.put_slice(path);
        }
        RequestBody::Write {
            fhandle,
            offset,
            path_id,
            data: payload,
        } => {
            body.put_slice(fhandle);
            body.put_i64(*offset);
            body.put_u8(*path_id);
            put_reserved(&mut body, 3);
            data.put_slice(payload);
        }
        RequestBody::Prepare {
            options,
            prty,
            port,
            option_x,
            paths,
        } => {
            body.put_u8(*options);
            body.put_u8(*prty);
            body.put_u16(*port);
            body.put_u16(*option_x);
            put_reserved(&mut body, 10);
            data.put_slice(paths);
        }
        RequestBody::Endsess { sessid } | RequestBody::Bind { sessid } => {
            body.put_slice(sessid);
        }
        RequestBody::Readv { path_id, chunks } => {
            put_reserved(&mut body, 15);
            body.put_u8(*path_id);
            for chunk in chunks {
                put_chunk(&mut data, &chunk.fhandle, chunk.rlen, chunk.offset);
            }
        }
        RequestBody::Pgwrite {
            fhandle,
            offset,
            path_id,
            reqflags,
            data: payload,
        } => {
            body.put_slice(fhandle);
            body.put_i64(*offset);
            body.put_u8(*path_id);
            body.put_u8(*reqflags);
            put_reserved(&mut body, 2);
            data.put_slice(payload);
        }
        RequestBody::Locate { options, path } => {
            body.put_u16(*options);
            put_reserved(&mut body, 14);
            data.put_slice(path);
        }
        RequestBody::Truncate {
            fhandle,
            offset,
            path,
        } => {
            body.put_slice(fhandle);
            body.put_i64(*offset);
            put_reserved(&mut body, 4);
            data.put_slice(path);
        }
        RequestBody::Pgread {
            fhandle,
            offset,
            rlen,
            args,
        } => {
            body.put_slice(fhandle);
            body.put_i64(*offset);
            body.put_i32(*rlen);
            if let Some(args) = args {
                data.put_u8(args.path_id);
                data.put_u8(args.reqflags);
            }
        }
        RequestBody::Writev { options, chunks } => {
            body.put_u8(*options);
            put_reserved(&mut body, 15);
            for chunk in chunks {
                put_chunk(&mut data, &chunk.fhandle, chunk.wlen, chunk.offset);
            }
        }
        RequestBody::Opaque {
            header,
            data: payload,
            ..
        } => {
            body.put_slice(header);
            data.put_slice(payload);
        }
    }
    debug_assert_eq!(body.len(), 16);

    let dlen = u32::try_from(data.len()).map_err(|_| TransportError::PayloadTooLarge {
        size: u32::MAX,
        max_size: u32::MAX,
    })?;

    let mut msg = Message::new();
    let mut head = BytesMut::with_capacity(REQUEST_HEADER_SIZE);
    head.put_slice(&req.stream_id);
    head.put_u16(req.body.request_id());
    head.put_slice(&body);
    head.put_u32(dlen);
    msg.append(&head);
    msg.append(&data);
    msg.set_marshalled(true);
    msg.set_description(describe_request(req));
    Ok(msg)
}

fn invalid(reason: impl Into<String>) -> TransportError {
    TransportError::InvalidMessage {
        reason: reason.into(),
    }
}

fn take_array<const N: usize>(buf: &mut &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    out
}

fn decode_chunks(data: &[u8], name: &str) -> Result<Vec<(FileHandle, i32, i64)>> {
    if data.len() % CHUNK_SIZE != 0 {
        return Err(invalid(format!(
            "{}: chunk list of {} bytes is not a multiple of {}",
            name,
            data.len(),
            CHUNK_SIZE
        )));
    }
    let mut buf = data;
    let mut chunks = Vec::with_capacity(data.len() / CHUNK_SIZE);
    while buf.has_remaining() {
        let fhandle = take_array::<4>(&mut buf);
        let len = buf.get_i32();
        let offset = buf.get_i64();
        chunks.push((fhandle, len, offset));
    }
    Ok(chunks)
}

fn expect_no_data(data: &[u8], id: RequestId) -> Result<()> {
    if data.is_empty() {
        Ok(())
    } else {
        Err(invalid(format!("{}: unexpected {} bytes of data", id, data.len())))
    }
}

/// Unmarshals a request from its wire form.
pub fn decode_request(wire: &[u8]) -> Result<ClientRequest> {
    if wire.len() < REQUEST_HEADER_SIZE {
        return Err(invalid(format!(
            "request header needs {} bytes, got {}",
            REQUEST_HEADER_SIZE,
            wire.len()
        )));
    }
    let mut head = &wire[..REQUEST_HEADER_SIZE];
    let stream_id = take_array::<2>(&mut head);
    let raw_id = head.get_u16();
    let header = take_array::<16>(&mut head);
    let dlen = head.get_u32() as usize;

    let data = &wire[REQUEST_HEADER_SIZE..];
    if data.len() != dlen {
        return Err(invalid(format!(
            "request announces {} bytes of data, carries {}",
            dlen,
            data.len()
        )));
    }

    let Some(id) = RequestId::from_u16(raw_id) else {
        return Ok(ClientRequest::new(
            stream_id,
            RequestBody::Opaque {
                request_id: raw_id,
                header,
                data: Bytes::copy_from_slice(data),
            },
        ));
    };

    let mut b = &header[..];
    let payload = || Bytes::copy_from_slice(data);
    let body = match id {
        RequestId::Auth => {
            b.advance(12);
            RequestBody::Auth {
                credtype: take_array::<4>(&mut b),
                credentials: payload(),
            }
        }
        RequestId::Query => {
            let infotype = b.get_u16();
            b.advance(2);
            RequestBody::Query {
                infotype,
                fhandle: take_array::<4>(&mut b),
                args: payload(),
            }
        }
        RequestId::Chmod => {
            b.advance(14);
            RequestBody::Chmod {
                mode: b.get_u16(),
                path: payload(),
            }
        }
        RequestId::Close => {
            expect_no_data(data, id)?;
            RequestBody::Close {
                fhandle: take_array::<4>(&mut b),
            }
        }
        RequestId::Sync => {
            expect_no_data(data, id)?;
            RequestBody::Sync {
                fhandle: take_array::<4>(&mut b),
            }
        }
        RequestId::Dirlist => {
            b.advance(15);
            RequestBody::Dirlist {
                options: b.get_u8(),
                path: payload(),
            }
        }
        RequestId::Protocol => {
            expect_no_data(data, id)?;
            RequestBody::Protocol {
                clientpv: b.get_u32(),
                flags: b.get_u8(),
                expect: b.get_u8(),
            }
        }
        RequestId::Login => RequestBody::Login {
            pid: b.get_u32(),
            username: take_array::<8>(&mut b),
            ability2: b.get_u8(),
            ability: b.get_u8(),
            capver: b.get_u8(),
            cgi: payload(),
        },
        RequestId::Mkdir => {
            let options = b.get_u8();
            b.advance(13);
            RequestBody::Mkdir {
                options,
                mode: b.get_u16(),
                path: payload(),
            }
        }
        RequestId::Mv => {
            b.advance(14);
            RequestBody::Mv {
                arg1len: b.get_i16(),
                args: payload(),
            }
        }
        RequestId::Open => RequestBody::Open {
            mode: b.get_u16(),
            options: b.get_u16(),
            path: payload(),
        },
        RequestId::Ping => {
            expect_no_data(data, id)?;
            RequestBody::Ping
        }
        RequestId::Read => {
            let fhandle = take_array::<4>(&mut b);
            let offset = b.get_i64();
            let rlen = b.get_i32();
            let args = match data.len() {
                0 => None,
                n if n >= READ_ARGS_SIZE => Some(ReadArgs {
                    path_id: data[0],
                    trailer: Bytes::copy_from_slice(&data[READ_ARGS_SIZE..]),
                }),
                n => {
                    return Err(invalid(format!("{}: read arguments of {} bytes", id, n)));
                }
            };
            RequestBody::Read {
                fhandle,
                offset,
                rlen,
                args,
            }
        }
        RequestId::Rm => RequestBody::Rm { path: payload() },
        RequestId::Rmdir => RequestBody::Rmdir { path: payload() },
        RequestId::Stat => {
            let options = b.get_u8();
            b.advance(11);
            RequestBody::Stat {
                options,
                fhandle: take_array::<4>(&mut b),
                path: payload(),
            }
        }
        RequestId::Write => RequestBody::Write {
            fhandle: take_array::<4>(&mut b),
            offset: b.get_i64(),
            path_id: b.get_u8(),
            data: payload(),
        },
        RequestId::Prepare => RequestBody::Prepare {
            options: b.get_u8(),
            prty: b.get_u8(),
            port: b.get_u16(),
            option_x: b.get_u16(),
            paths: payload(),
        },
        RequestId::Endsess => {
            expect_no_data(data, id)?;
            RequestBody::Endsess {
                sessid: take_array::<SESSION_ID_SIZE>(&mut b),
            }
        }
        RequestId::Bind => {
            expect_no_data(data, id)?;
            RequestBody::Bind {
                sessid: take_array::<SESSION_ID_SIZE>(&mut b),
            }
        }
        RequestId::Readv => {
            b.advance(15);
            let path_id = b.get_u8();
            let chunks = decode_chunks(data, id.name())?
                .into_iter()
                .map(|(fhandle, rlen, offset)| ReadChunk {
                    fhandle,
                    rlen,
                    offset,
                })
                .collect();
            RequestBody::Readv { path_id, chunks }
        }
        RequestId::Pgwrite => RequestBody::Pgwrite {
            fhandle: take_array::<4>(&mut b),
            offset: b.get_i64(),
            path_id: b.get_u8(),
            reqflags: b.get_u8(),
            data: payload(),
        },
        RequestId::Locate => RequestBody::Locate {
            options: b.get_u16(),
            path: payload(),
        },
        RequestId::Truncate => RequestBody::Truncate {
            fhandle: take_array::<4>(&mut b),
            offset: b.get_i64(),
            path: payload(),
        },
        RequestId::Pgread => {
            let fhandle = take_array::<4>(&mut b);
            let offset = b.get_i64();
            let rlen = b.get_i32();
            let args = match data.len() {
                0 => None,
                PGREAD_ARGS_SIZE => Some(PgReadArgs {
                    path_id: data[0],
                    reqflags: data[1],
                }),
                n => {
                    return Err(invalid(format!("{}: page read arguments of {} bytes", id, n)));
                }
            };
            RequestBody::Pgread {
                fhandle,
                offset,
                rlen,
                args,
            }
        }
        RequestId::Writev => {
            let options = b.get_u8();
            let chunks = decode_chunks(data, id.name())?
                .into_iter()
                .map(|(fhandle, wlen, offset)| WriteChunk {
                    fhandle,
                    wlen,
                    offset,
                })
                .collect();
            RequestBody::Writev { options, chunks }
        }
    };

    Ok(ClientRequest::new(stream_id, body))
}

/// Decoded response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Correlation id of the request being answered.
    pub stream_id: StreamId,
    /// Response status.
    pub status: ResponseStatus,
    /// Body length.
    pub dlen: u32,
}

impl ResponseHeader {
    /// Parses the first 8 bytes of a response.
    pub fn decode(wire: &[u8]) -> Result<Self> {
        if wire.len() < RESPONSE_HEADER_SIZE {
            return Err(invalid(format!(
                "response header needs {} bytes, got {}",
                RESPONSE_HEADER_SIZE,
                wire.len()
            )));
        }
        let mut b = &wire[..RESPONSE_HEADER_SIZE];
        let stream_id = take_array::<2>(&mut b);
        let status = ResponseStatus::from_u16(b.get_u16());
        let dlen = b.get_u32();
        if dlen > MAX_BODY_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: dlen,
                max_size: MAX_BODY_SIZE,
            });
        }
        Ok(Self {
            stream_id,
            status,
            dlen,
        })
    }
}

/// Status specific part of a server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Final answer with its payload.
    Ok(Bytes),
    /// Partial answer; more responses follow.
    OkSoFar(Bytes),
    /// Request failed with `errnum`.
    Error {
        /// Server error number.
        errnum: u32,
        /// Human readable reason.
        message: String,
    },
    /// Retry the request after `seconds`.
    Wait {
        /// Delay before retrying.
        seconds: i32,
        /// Optional reason.
        info: String,
    },
    /// The answer arrives asynchronously within `seconds`.
    WaitResp {
        /// Upper bound on the wait.
        seconds: i32,
    },
    /// Reissue the request at another server.
    Redirect {
        /// Target port.
        port: i32,
        /// Target host, possibly with CGI.
        host: String,
    },
    /// Unsolicited server action.
    Attn {
        /// Action code.
        actnum: u32,
        /// Action parameters.
        params: Bytes,
    },
    /// Further authentication round, carrying the challenge.
    AuthMore(Bytes),
    /// Status response, kept raw.
    Status(Bytes),
    /// Status this codec does not know.
    Unknown {
        /// Raw status.
        status: u16,
        /// Raw body.
        data: Bytes,
    },
}

/// A server response in host representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    /// Correlation id of the request being answered.
    pub stream_id: StreamId,
    /// Status and payload.
    pub body: ResponseBody,
}

impl ServerResponse {
    /// Pairs a body with its stream id.
    pub fn new(stream_id: StreamId, body: ResponseBody) -> Self {
        Self { stream_id, body }
    }

    /// Wire status of the body.
    pub fn status(&self) -> ResponseStatus {
        match &self.body {
            ResponseBody::Ok(_) => ResponseStatus::Ok,
            ResponseBody::OkSoFar(_) => ResponseStatus::OkSoFar,
            ResponseBody::Error { .. } => ResponseStatus::Error,
            ResponseBody::Wait { .. } => ResponseStatus::Wait,
            ResponseBody::WaitResp { .. } => ResponseStatus::WaitResp,
            ResponseBody::Redirect { .. } => ResponseStatus::Redirect,
            ResponseBody::Attn { .. } => ResponseStatus::Attn,
            ResponseBody::AuthMore(_) => ResponseStatus::AuthMore,
            ResponseBody::Status(_) => ResponseStatus::Status,
            ResponseBody::Unknown { status, .. } => ResponseStatus::from_u16(*status),
        }
    }

    /// Payload of an `ok` response.
    pub fn ok_data(&self) -> Option<&Bytes> {
        match &self.body {
            ResponseBody::Ok(data) => Some(data),
            _ => None,
        }
    }

    /// Inner response of an `attn`/`asynresp` wrapper, if this is one.
    pub fn async_response(&self) -> Result<Option<ServerResponse>> {
        match &self.body {
            ResponseBody::Attn { actnum, params } if *actnum == ATTN_ASYNRESP => {
                if params.len() < 4 + RESPONSE_HEADER_SIZE {
                    return Err(invalid("kXR_attn: asynchronous response too short"));
                }
                decode_response(&params[4..]).map(Some)
            }
            _ => Ok(None),
        }
    }
}

fn trimmed_string(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn require(data: &[u8], min: usize, what: &str) -> Result<()> {
    if data.len() < min {
        return Err(invalid(format!("{}: body too short", what)));
    }
    Ok(())
}

/// Unmarshals a complete response (header and body).
pub fn decode_response(wire: &[u8]) -> Result<ServerResponse> {
    let header = ResponseHeader::decode(wire)?;
    let data = &wire[RESPONSE_HEADER_SIZE..];
    if data.len() != header.dlen as usize {
        return Err(invalid(format!(
            "response announces {} bytes, carries {}",
            header.dlen,
            data.len()
        )));
    }

    let mut b = data;
    let body = match header.status {
        ResponseStatus::Ok => ResponseBody::Ok(Bytes::copy_from_slice(data)),
        ResponseStatus::OkSoFar => ResponseBody::OkSoFar(Bytes::copy_from_slice(data)),
        ResponseStatus::AuthMore => ResponseBody::AuthMore(Bytes::copy_from_slice(data)),
        ResponseStatus::Status => ResponseBody::Status(Bytes::copy_from_slice(data)),
        ResponseStatus::Error => {
            require(data, 4, "kXR_error")?;
            ResponseBody::Error {
                errnum: b.get_u32(),
                message: trimmed_string(b),
            }
        }
        ResponseStatus::Wait => {
            require(data, 4, "kXR_wait")?;
            ResponseBody::Wait {
                seconds: b.get_i32(),
                info: trimmed_string(b),
            }
        }
        ResponseStatus::WaitResp => {
            require(data, 4, "kXR_waitresp")?;
            ResponseBody::WaitResp {
                seconds: b.get_i32(),
            }
        }
        ResponseStatus::Redirect => {
            require(data, 4, "kXR_redirect")?;
            ResponseBody::Redirect {
                port: b.get_i32(),
                host: trimmed_string(b),
            }
        }
        ResponseStatus::Attn => {
            require(data, 4, "kXR_attn")?;
            ResponseBody::Attn {
                actnum: b.get_u32(),
                params: Bytes::copy_from_slice(b),
            }
        }
        ResponseStatus::Other(status) => ResponseBody::Unknown {
            status,
            data: Bytes::copy_from_slice(data),
        },
    };

    Ok(ServerResponse::new(header.stream_id, body))
}

/// Marshals a response. Used by test servers and for re-wrapping
/// asynchronous responses.
pub fn encode_response(rsp: &ServerResponse) -> Result<Message> {
    let mut data = BytesMut::new();
    match &rsp.body {
        ResponseBody::Ok(payload)
        | ResponseBody::OkSoFar(payload)
        | ResponseBody::AuthMore(payload)
        | ResponseBody::Status(payload) => data.put_slice(payload),
        ResponseBody::Error { errnum, message } => {
            data.put_u32(*errnum);
            data.put_slice(message.as_bytes());
        }
        ResponseBody::Wait { seconds, info } => {
            data.put_i32(*seconds);
            data.put_slice(info.as_bytes());
        }
        ResponseBody::WaitResp { seconds } => data.put_i32(*seconds),
        ResponseBody::Redirect { port, host } => {
            data.put_i32(*port);
            data.put_slice(host.as_bytes());
        }
        ResponseBody::Attn { actnum, params } => {
            data.put_u32(*actnum);
            data.put_slice(params);
        }
        ResponseBody::Unknown { data: payload, .. } => data.put_slice(payload),
    }

    let dlen = u32::try_from(data.len())
        .ok()
        .filter(|len| *len <= MAX_BODY_SIZE)
        .ok_or(TransportError::PayloadTooLarge {
            size: u32::try_from(data.len()).unwrap_or(u32::MAX),
            max_size: MAX_BODY_SIZE,
        })?;

    let mut head = BytesMut::with_capacity(RESPONSE_HEADER_SIZE);
    head.put_slice(&rsp.stream_id);
    head.put_u16(rsp.status().as_u16());
    head.put_u32(dlen);

    let mut msg = Message::new();
    msg.append(&head);
    msg.append(&data);
    msg.set_marshalled(true);
    Ok(msg)
}

/// Reply to the initial client handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHandshake {
    /// Always zero.
    pub stream_id: StreamId,
    /// Handshake status, `ok` on success.
    pub status: ResponseStatus,
    /// Server protocol version.
    pub protover: u32,
    /// Server role, 1 for a data server.
    pub msgval: u32,
}

impl ServerHandshake {
    /// Parses the fixed 16 byte reply.
    pub fn decode(wire: &[u8]) -> Result<Self> {
        if wire.len() != SERVER_HANDSHAKE_SIZE {
            return Err(invalid(format!(
                "server handshake must be {} bytes, got {}",
                SERVER_HANDSHAKE_SIZE,
                wire.len()
            )));
        }
        let mut b = wire;
        let stream_id = take_array::<2>(&mut b);
        let status = ResponseStatus::from_u16(b.get_u16());
        let _msglen = b.get_u32();
        Ok(Self {
            stream_id,
            status,
            protover: b.get_u32(),
            msgval: b.get_u32(),
        })
    }

    /// Builds the wire form, as a server would send it.
    pub fn encode(&self) -> Message {
        let mut buf = BytesMut::with_capacity(SERVER_HANDSHAKE_SIZE);
        buf.put_slice(&self.stream_id);
        buf.put_u16(self.status.as_u16());
        buf.put_u32(8);
        buf.put_u32(self.protover);
        buf.put_u32(self.msgval);
        Message::from_wire(&buf)
    }

    /// Server role announced by the handshake.
    pub fn server_flags(&self) -> ServerFlags {
        ServerFlags::from_handshake(self.msgval)
    }
}

/// Security requirements the server attached to its protocol response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecurityRequirements {
    /// Security protocol version.
    pub version: u8,
    /// Security options.
    pub options: u8,
    /// Required signing level.
    pub level: u8,
    /// Per request overrides as `(request index, required level)`.
    pub overrides: Vec<(u8, u8)>,
}

/// Body of the `ok` reply to a protocol request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProtocolResponse {
    /// Server protocol version.
    pub pval: u32,
    /// Server role and attribute flags.
    pub flags: u32,
    /// Preferred interfaces for parallel sub-streams.
    pub bind_prefs: Vec<String>,
    /// Present when the server asks for request signing.
    pub security: Option<SecurityRequirements>,
}

impl ProtocolResponse {
    /// Parses the body, including the optional `B` and `S` sections.
    pub fn decode(data: &[u8]) -> Result<Self> {
        require(data, 8, "kXR_protocol")?;
        let mut b = data;
        let mut rsp = ProtocolResponse {
            pval: b.get_u32(),
            flags: b.get_u32(),
            ..Default::default()
        };

        if b.len() >= 4 && b[0] == b'B' {
            b.advance(2);
            let len = b.get_u16() as usize;
            if b.len() < len {
                return Err(TransportError::DataError {
                    reason: "Received incomplete protocol response.".to_string(),
                });
            }
            rsp.bind_prefs = b[..len]
                .split(|c| *c == b',')
                .map(trimmed_string)
                .filter(|s| !s.is_empty())
                .collect();
            b.advance(len);
        }

        if b.len() >= 6 && b[0] == b'S' {
            b.advance(2);
            let version = b.get_u8();
            let options = b.get_u8();
            let level = b.get_u8();
            let count = b.get_u8() as usize;
            let overrides = b
                .chunks_exact(2)
                .take(count)
                .map(|pair| (pair[0], pair[1]))
                .collect();
            rsp.security = Some(SecurityRequirements {
                version,
                options,
                level,
                overrides,
            });
        }

        Ok(rsp)
    }

    /// Inverse of [`ProtocolResponse::decode`].
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.pval);
        buf.put_u32(self.flags);
        if !self.bind_prefs.is_empty() {
            let joined = self.bind_prefs.join(",");
            buf.put_u8(b'B');
            buf.put_u8(0);
            buf.put_u16(joined.len() as u16);
            buf.put_slice(joined.as_bytes());
        }
        if let Some(sec) = &self.security {
            buf.put_u8(b'S');
            buf.put_u8(0);
            buf.put_u8(sec.version);
            buf.put_u8(sec.options);
            buf.put_u8(sec.level);
            buf.put_u8(sec.overrides.len() as u8);
            for (index, level) in &sec.overrides {
                buf.put_u8(*index);
                buf.put_u8(*level);
            }
        }
        buf.freeze()
    }
}

/// Body of the `ok` reply to a login request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    /// Session to bind parallel sub-streams to.
    pub session_id: SessionId,
    /// Authentication parameters; empty when no authentication is needed.
    pub security: Bytes,
}

impl LoginResponse {
    /// Splits the session id from the security parameters.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < SESSION_ID_SIZE {
            return Err(TransportError::DataError {
                reason: "Login response too short.".to_string(),
            });
        }
        let mut b = data;
        Ok(Self {
            session_id: take_array::<SESSION_ID_SIZE>(&mut b),
            security: Bytes::copy_from_slice(b),
        })
    }
}

/// Path id assigned by a successful bind.
pub fn decode_bind_response(data: &[u8]) -> Result<u8> {
    data.first()
        .copied()
        .ok_or_else(|| invalid("kXR_bind: body too short"))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

fn text(data: &[u8]) -> String {
    trimmed_string(data)
}

/// One line description of a request for log output.
pub fn describe_request(req: &ClientRequest) -> String {
    let name = match req.request_id() {
        Some(id) => id.name().to_string(),
        None => format!("kXR_unknown({})", req.body.request_id()),
    };
    let detail = match &req.body {
        RequestBody::Open {
            mode,
            options,
            path,
        } => format!(
            "file: {}, mode: 0{:o}, options: 0x{:04x}",
            text(path),
            mode,
            options
        ),
        RequestBody::Close { fhandle } | RequestBody::Sync { fhandle } => {
            format!("handle: 0x{}", hex(fhandle))
        }
        RequestBody::Stat {
            options,
            fhandle,
            path,
        } => {
            if path.is_empty() {
                format!("handle: 0x{}, options: {}", hex(fhandle), options)
            } else {
                format!("path: {}, options: {}", text(path), options)
            }
        }
        RequestBody::Read {
            fhandle,
            offset,
            rlen,
            ..
        }
        | RequestBody::Pgread {
            fhandle,
            offset,
            rlen,
            ..
        } => format!("handle: 0x{}, offset: {}, size: {}", hex(fhandle), offset, rlen),
        RequestBody::Write {
            fhandle,
            offset,
            data,
            ..
        }
        | RequestBody::Pgwrite {
            fhandle,
            offset,
            data,
            ..
        } => format!(
            "handle: 0x{}, offset: {}, size: {}",
            hex(fhandle),
            offset,
            data.len()
        ),
        RequestBody::Truncate {
            fhandle,
            offset,
            path,
        } => {
            if path.is_empty() {
                format!("handle: 0x{}, offset: {}", hex(fhandle), offset)
            } else {
                format!("file: {}, offset: {}", text(path), offset)
            }
        }
        RequestBody::Readv { chunks, .. } => {
            let total: i64 = chunks.iter().map(|c| i64::from(c.rlen)).sum();
            let handle = chunks
                .first()
                .map(|c| format!("0x{}", hex(&c.fhandle)))
                .unwrap_or_else(|| "unknown".to_string());
            let list = chunks
                .iter()
                .map(|c| format!("(offset: {}, size: {})", c.offset, c.rlen))
                .collect::<Vec<_>>()
                .join("; ");
            format!("handle: {}, chunks: [{}], total size: {}", handle, list, total)
        }
        RequestBody::Writev { chunks, .. } => {
            let total: i64 = chunks.iter().map(|c| i64::from(c.wlen)).sum();
            let handle = chunks
                .last()
                .map(|c| format!("0x{}", hex(&c.fhandle)))
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "handle: {}, chunks: {}, total size: {}",
                handle,
                chunks.len(),
                total
            )
        }
        RequestBody::Locate { options, path } => {
            format!("path: {}, options: 0x{:04x}", text(path), options)
        }
        RequestBody::Mv { arg1len, args } => {
            let split = usize::try_from(*arg1len).unwrap_or(0).min(args.len());
            let source = text(&args[..split]);
            let destination = text(args.get(split + 1..).unwrap_or_default());
            format!("source: {}, destination: {}", source, destination)
        }
        RequestBody::Mkdir { mode, path, .. } | RequestBody::Chmod { mode, path } => {
            format!("path: {}, mode: 0{:o}", text(path), mode)
        }
        RequestBody::Rm { path } | RequestBody::Rmdir { path } => {
            format!("path: {}", text(path))
        }
        RequestBody::Dirlist { path, .. } => format!("path: {}", text(path)),
        RequestBody::Query {
            infotype, fhandle, ..
        } => format!("infotype: {}, handle: 0x{}", infotype, hex(fhandle)),
        RequestBody::Prepare { paths, .. } => {
            format!("paths: {}", text(paths).replace('\n', " "))
        }
        RequestBody::Endsess { sessid } | RequestBody::Bind { sessid } => {
            format!("session: {}", hex(sessid))
        }
        RequestBody::Opaque { data, .. } => format!("size: {}", data.len()),
        RequestBody::Protocol { .. }
        | RequestBody::Login { .. }
        | RequestBody::Auth { .. }
        | RequestBody::Ping => String::new(),
    };
    format!("{} ({})", name, detail)
}

/// Renders server flags as `type: server [meta]`.
pub fn server_flags_to_string(flags: ServerFlags) -> String {
    flags.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(body: RequestBody) {
        let req = ClientRequest::new([0, 7], body);
        let msg = encode_request(&req).unwrap();
        assert!(msg.is_marshalled());
        let back = decode_request(msg.as_slice()).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_open_layout_is_big_endian() {
        let req = ClientRequest::new(
            [1, 2],
            RequestBody::Open {
                mode: 0o644,
                options: 0x0010,
                path: Bytes::from_static(b"/data/file"),
            },
        );
        let msg = encode_request(&req).unwrap();
        let wire = msg.as_slice();
        assert_eq!(wire.len(), 24 + 10);
        assert_eq!(&wire[0..2], &[1, 2]);
        assert_eq!(&wire[2..4], &3010u16.to_be_bytes());
        assert_eq!(&wire[4..6], &0o644u16.to_be_bytes());
        assert_eq!(&wire[6..8], &0x0010u16.to_be_bytes());
        assert_eq!(&wire[20..24], &10u32.to_be_bytes());
        assert_eq!(&wire[24..], b"/data/file");
    }

    #[test]
    fn test_request_roundtrips() {
        roundtrip(RequestBody::Read {
            fhandle: [1, 2, 3, 4],
            offset: 1 << 40,
            rlen: 4096,
            args: None,
        });
        roundtrip(RequestBody::Read {
            fhandle: [1, 2, 3, 4],
            offset: 0,
            rlen: 10,
            args: Some(ReadArgs {
                path_id: 3,
                trailer: Bytes::new(),
            }),
        });
        roundtrip(RequestBody::Readv {
            path_id: 2,
            chunks: vec![
                ReadChunk {
                    fhandle: [0, 0, 0, 1],
                    rlen: 100,
                    offset: 5,
                },
                ReadChunk {
                    fhandle: [0, 0, 0, 1],
                    rlen: 200,
                    offset: 1000,
                },
            ],
        });
        roundtrip(RequestBody::Login {
            pid: 4242,
            username: *b"alice\0\0\0",
            ability2: 0,
            ability: 0xc5,
            capver: 0x85,
            cgi: Bytes::from_static(b"xrd.cc=us&xrd.tz=0"),
        });
        roundtrip(RequestBody::Mv {
            arg1len: 4,
            args: Bytes::from_static(b"/a/b /c/d"),
        });
        roundtrip(RequestBody::Opaque {
            request_id: 3012,
            header: [9; 16],
            data: Bytes::from_static(b"chkpoint"),
        });
    }

    #[test]
    fn test_decode_rejects_bad_lengths() {
        assert!(matches!(
            decode_request(&[0u8; 10]),
            Err(TransportError::InvalidMessage { .. })
        ));

        let req = ClientRequest::new([0, 1], RequestBody::Ping);
        let mut wire = encode_request(&req).unwrap().as_slice().to_vec();
        wire.push(0);
        assert!(decode_request(&wire).is_err());

        let req = ClientRequest::new(
            [0, 1],
            RequestBody::Readv {
                path_id: 0,
                chunks: vec![ReadChunk::default()],
            },
        );
        let mut wire = encode_request(&req).unwrap().as_slice().to_vec();
        wire.truncate(wire.len() - 1);
        wire[20..24].copy_from_slice(&15u32.to_be_bytes());
        assert!(matches!(
            decode_request(&wire),
            Err(TransportError::InvalidMessage { .. })
        ));
    }

    #[test]
    fn test_response_decoding() {
        let rsp = ServerResponse::new(
            [0, 3],
            ResponseBody::Error {
                errnum: 3011,
                message: "no such file".to_string(),
            },
        );
        let msg = encode_response(&rsp).unwrap();
        let mut wire = msg.as_slice().to_vec();
        wire.push(0);
        let body_len = (wire.len() - 8) as u32;
        wire[4..8].copy_from_slice(&body_len.to_be_bytes());
        let back = decode_response(&wire).unwrap();
        assert_eq!(back, rsp);

        // wait with a body shorter than its fixed prefix
        let wire = [0, 1, 0x0f, 0xa5, 0, 0, 0, 2, 0, 0];
        assert!(matches!(
            decode_response(&wire),
            Err(TransportError::InvalidMessage { .. })
        ));
    }

    #[test]
    fn test_async_response_unwrapping() {
        let inner = ServerResponse::new([0, 9], ResponseBody::Ok(Bytes::from_static(b"done")));
        let inner_wire = encode_response(&inner).unwrap();
        let mut params = vec![0u8; 4];
        params.extend_from_slice(inner_wire.as_slice());
        let outer = ServerResponse::new(
            [0, 0],
            ResponseBody::Attn {
                actnum: ATTN_ASYNRESP,
                params: Bytes::from(params),
            },
        );
        let wire = encode_response(&outer).unwrap();
        let decoded = decode_response(wire.as_slice()).unwrap();
        assert_eq!(decoded.async_response().unwrap(), Some(inner));

        let plain = ServerResponse::new([0, 0], ResponseBody::Ok(Bytes::new()));
        assert_eq!(plain.async_response().unwrap(), None);
    }

    #[test]
    fn test_protocol_response_with_bind_prefs_and_security() {
        let rsp = ProtocolResponse {
            pval: 0x520,
            flags: ServerFlags::IS_SERVER,
            bind_prefs: vec!["eth0".to_string(), "10.0.0.2".to_string()],
            security: Some(SecurityRequirements {
                version: 0,
                options: 1,
                level: 2,
                overrides: vec![(4, 1)],
            }),
        };
        let decoded = ProtocolResponse::decode(&rsp.encode()).unwrap();
        assert_eq!(decoded, rsp);

        assert!(matches!(
            ProtocolResponse::decode(&[0, 0, 5]),
            Err(TransportError::InvalidMessage { .. })
        ));

        let mut truncated = rsp.encode().to_vec();
        truncated.truncate(14);
        assert!(matches!(
            ProtocolResponse::decode(&truncated),
            Err(TransportError::DataError { .. })
        ));
    }

    #[test]
    fn test_server_handshake_and_login_response() {
        let hs = ServerHandshake {
            stream_id: [0, 0],
            status: ResponseStatus::Ok,
            protover: 0x500,
            msgval: 1,
        };
        let decoded = ServerHandshake::decode(hs.encode().as_slice()).unwrap();
        assert_eq!(decoded, hs);
        assert!(decoded.server_flags().is_data_server());

        let mut body = vec![7u8; 16];
        body.extend_from_slice(b"&P=unix");
        let login = LoginResponse::decode(&body).unwrap();
        assert_eq!(login.session_id, [7u8; 16]);
        assert_eq!(login.security.as_ref(), b"&P=unix");

        assert!(matches!(
            LoginResponse::decode(&[1, 2, 3]),
            Err(TransportError::DataError { .. })
        ));
        assert_eq!(decode_bind_response(&[5]).unwrap(), 5);
        assert!(decode_bind_response(&[]).is_err());
    }

    #[test]
    fn test_describe_request() {
        let req = ClientRequest::new(
            [0, 1],
            RequestBody::Read {
                fhandle: [0, 0, 0, 0x2a],
                offset: 128,
                rlen: 64,
                args: None,
            },
        );
        assert_eq!(
            describe_request(&req),
            "kXR_read (handle: 0x0000002a, offset: 128, size: 64)"
        );

        let req = ClientRequest::new(
            [0, 1],
            RequestBody::Mv {
                arg1len: 2,
                args: Bytes::from_static(b"/a /b"),
            },
        );
        assert_eq!(describe_request(&req), "kXR_mv (source: /a, destination: /b)");
        assert_eq!(
            server_flags_to_string(ServerFlags::from_bits(
                ServerFlags::IS_SERVER | ServerFlags::ATTR_META
            )),
            "type: server [meta]"
        );
    }
}
