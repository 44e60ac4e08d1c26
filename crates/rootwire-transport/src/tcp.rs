//! Async socket driver for the handshake engine.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::channel::{Channel, ReceivedAction, StreamStatus};
use crate::codec::{decode_response, encode_request, ClientRequest, ResponseHeader, ServerResponse};
use crate::error::{Result, TransportError};
use crate::handshake::{HandshakeContext, HandshakeStep};
use crate::message::Message;
use crate::protocol::{RESPONSE_HEADER_SIZE, SERVER_HANDSHAKE_SIZE};

/// Reads one response: the 8 byte header, then its body.
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; RESPONSE_HEADER_SIZE];
    reader
        .read_exact(&mut header_buf)
        .await
        .map_err(TransportError::IoError)?;
    // rejects bodies above MAX_BODY_SIZE before anything is allocated
    let header = ResponseHeader::decode(&header_buf)?;

    let mut msg = Message::with_size(RESPONSE_HEADER_SIZE + header.dlen as usize);
    msg.as_mut_slice()[..RESPONSE_HEADER_SIZE].copy_from_slice(&header_buf);
    msg.set_cursor(RESPONSE_HEADER_SIZE);
    if header.dlen > 0 {
        reader
            .read_exact(msg.buffer_at_cursor())
            .await
            .map_err(TransportError::IoError)?;
    }
    msg.set_cursor(0);
    msg.set_marshalled(true);
    Ok(msg)
}

/// Reads the fixed size reply to the initial handshake.
pub async fn read_handshake<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; SERVER_HANDSHAKE_SIZE];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(TransportError::IoError)?;
    Ok(Message::from_wire(&buf))
}

/// Writes a marshalled message and flushes the writer.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(msg.as_slice())
        .await
        .map_err(TransportError::IoError)?;
    writer.flush().await.map_err(TransportError::IoError)?;
    Ok(())
}

/// One physical connection of a channel.
#[derive(Debug)]
pub struct SubStreamConnection {
    stream: TcpStream,
    substream: u16,
    stream_name: String,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl SubStreamConnection {
    /// Connects to the channel's endpoint and runs the handshake.
    pub async fn connect(channel: &Channel, substream: u16) -> Result<Self> {
        let url = channel.url();
        let addr = format!("{}:{}", url.host, url.port);
        let timeout = Duration::from_secs(channel.config().request_timeout_secs);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| TransportError::SocketTimeout {
                stream: addr.clone(),
                timeout_secs: timeout.as_secs(),
            })?
            .map_err(TransportError::IoError)?;
        stream.set_nodelay(true).map_err(TransportError::IoError)?;
        tracing::debug!(addr = %addr, substream = substream, "TCP connected");
        Self::establish(channel, substream, stream).await
    }

    /// Runs the handshake of `substream` over an already connected socket.
    pub async fn establish(channel: &Channel, substream: u16, stream: TcpStream) -> Result<Self> {
        let mut conn = Self {
            peer_addr: stream.peer_addr().ok(),
            local_addr: stream.local_addr().ok(),
            stream,
            substream,
            stream_name: format!("[{}.{}]", channel.url().host_id(), substream),
        };
        match conn.run_handshake(channel).await {
            Ok(()) => Ok(conn),
            // the engine leaves its state alone on InvalidOp
            Err(err @ TransportError::InvalidOp { .. }) => Err(err),
            Err(err) => {
                channel.mark_broken(substream);
                Err(err)
            }
        }
    }

    async fn run_handshake(&mut self, channel: &Channel) -> Result<()> {
        let client_name = self
            .local_addr
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "localhost".to_string());
        let timeout = Duration::from_secs(channel.config().request_timeout_secs);
        let mut inbound: Option<Message> = None;

        loop {
            let mut ctx = HandshakeContext::new(self.substream, &self.stream_name);
            ctx.client_name = &client_name;
            ctx.local_addr = self.local_addr;
            ctx.server_addr = self.peer_addr;
            ctx.inbound = inbound.as_ref();

            match channel.handshake_step(&ctx)? {
                HandshakeStep::Connected => return Ok(()),
                HandshakeStep::Send(msg) => {
                    write_message(&mut self.stream, &msg).await?;
                    channel.metrics().add_bytes_sent(msg.len() as u64);
                }
                HandshakeStep::AwaitReply => {}
            }

            let expect_handshake =
                channel.stream_status(self.substream) == Some(StreamStatus::HandshakeSent);
            let stream = &mut self.stream;
            let read = async move {
                if expect_handshake {
                    read_handshake(stream).await
                } else {
                    read_message(stream).await
                }
            };
            let msg = tokio::time::timeout(timeout, read)
                .await
                .map_err(|_| TransportError::SocketTimeout {
                    stream: self.stream_name.clone(),
                    timeout_secs: timeout.as_secs(),
                })??;
            channel.metrics().add_bytes_received(msg.len() as u64);
            inbound = Some(msg);
        }
    }

    /// Marshals and writes a request, recording it with the channel.
    pub async fn send_request(&mut self, channel: &Channel, request: &ClientRequest) -> Result<()> {
        let msg = encode_request(request)?;
        write_message(&mut self.stream, &msg).await?;
        channel.metrics().add_bytes_sent(msg.len() as u64);
        channel.message_sent(request, self.substream);
        Ok(())
    }

    /// Reads the next response and lets the channel classify it.
    pub async fn recv_response(
        &mut self,
        channel: &Channel,
    ) -> Result<(ServerResponse, ReceivedAction)> {
        let msg = read_message(&mut self.stream).await?;
        channel.metrics().add_bytes_received(msg.len() as u64);
        let rsp = decode_response(msg.as_slice())?;
        let rsp = rsp.async_response()?.unwrap_or(rsp);
        let action = channel.message_received(&rsp, self.substream);
        Ok((rsp, action))
    }

    /// Index of this sub-stream within its channel.
    pub fn substream(&self) -> u16 {
        self.substream
    }

    /// Log name, `[host:port.substream]`.
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Remote address, if the socket reported one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Gives up the handshake bookkeeping and returns the socket.
    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_response, ResponseBody};
    use crate::protocol::MAX_BODY_SIZE;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_read_message_from_bytes() {
        let wire = encode_response(&ServerResponse::new(
            [0, 5],
            ResponseBody::Ok(Bytes::from_static(b"hello")),
        ))
        .unwrap();
        let mut data = wire.as_slice().to_vec();
        data.extend_from_slice(b"trailing");

        let mut reader = data.as_slice();
        let msg = read_message(&mut reader).await.unwrap();
        assert_eq!(msg.as_slice(), wire.as_slice());
        assert!(msg.is_marshalled());
        assert_eq!(reader, b"trailing");
    }

    #[tokio::test]
    async fn test_read_message_rejects_huge_body() {
        let mut header = vec![0u8, 1, 0, 0];
        header.extend_from_slice(&(MAX_BODY_SIZE + 1).to_be_bytes());
        let mut reader = header.as_slice();
        assert!(matches!(
            read_message(&mut reader).await,
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_message_truncated_body() {
        let wire = encode_response(&ServerResponse::new(
            [0, 5],
            ResponseBody::Ok(Bytes::from_static(b"hello")),
        ))
        .unwrap();
        let mut reader = &wire.as_slice()[..10];
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, TransportError::IoError(_)));
    }

    #[tokio::test]
    async fn test_parallel_before_primary_keeps_state() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let socket = TcpStream::connect(addr).await.unwrap();
        let _server = accept.await.unwrap();

        let channel = crate::channel::tests::channel_with(2);
        let err = SubStreamConnection::establish(&channel, 1, socket)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidOp { .. }));
        assert_eq!(channel.stream_status(1), Some(StreamStatus::Disconnected));
        assert_eq!(channel.metrics().snapshot().handshakes_failed, 0);
    }

    #[tokio::test]
    async fn test_read_handshake() {
        let data = [0u8; 20];
        let mut reader = &data[..];
        let msg = read_handshake(&mut reader).await.unwrap();
        assert_eq!(msg.len(), SERVER_HANDSHAKE_SIZE);
        assert_eq!(reader.len(), 4);
    }
}
