//! End-to-end handshake against a scripted server on a local socket.

use std::sync::Arc;

use bytes::Bytes;
use rootwire_transport::codec::{ProtocolResponse, ServerHandshake};
use rootwire_transport::protocol::{ResponseStatus, ServerFlags, REQUEST_HEADER_SIZE};
use rootwire_transport::tcp::write_message;
use rootwire_transport::{
    decode_request, encode_response, Channel, ChannelQuery, ChannelUrl, ClientRequest,
    ProviderRegistry, QueryAnswer, ReceivedAction, RequestBody, ResponseBody, ServerResponse,
    StreamStatus, SubStreamConnection, TransportConfig,
};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

async fn read_request(stream: &mut TcpStream) -> ClientRequest {
    let mut wire = vec![0u8; REQUEST_HEADER_SIZE];
    stream.read_exact(&mut wire).await.unwrap();
    let dlen = u32::from_be_bytes([wire[20], wire[21], wire[22], wire[23]]) as usize;
    wire.resize(REQUEST_HEADER_SIZE + dlen, 0);
    stream.read_exact(&mut wire[REQUEST_HEADER_SIZE..]).await.unwrap();
    decode_request(&wire).unwrap()
}

async fn respond(stream: &mut TcpStream, sid: [u8; 2], body: ResponseBody) {
    let msg = encode_response(&ServerResponse::new(sid, body)).unwrap();
    write_message(stream, &msg).await.unwrap();
}

/// Handles the 20 byte handshake and the protocol request that follows it.
async fn serve_handshake(stream: &mut TcpStream) -> RequestBody {
    let mut hs = [0u8; 20];
    stream.read_exact(&mut hs).await.unwrap();
    assert_eq!(&hs[16..20], &2012i32.to_be_bytes());
    let protocol = read_request(stream).await;

    let reply = ServerHandshake {
        stream_id: [0, 0],
        status: ResponseStatus::Ok,
        protover: 0x520,
        msgval: 1,
    }
    .encode();
    write_message(stream, &reply).await.unwrap();

    let rsp = ProtocolResponse {
        pval: 0x520,
        flags: ServerFlags::IS_SERVER,
        bind_prefs: vec!["10.0.0.2".to_string()],
        security: None,
    };
    respond(stream, [0, 0], ResponseBody::Ok(rsp.encode())).await;
    protocol.body
}

fn channel(port: u16) -> Channel {
    let config = TransportConfig {
        substreams_per_channel: 2,
        request_timeout_secs: 5,
        ..Default::default()
    };
    Channel::new(
        ChannelUrl::new("127.0.0.1", port).with_user("alice"),
        config,
        Arc::new(ProviderRegistry::with_builtins()),
    )
}

#[tokio::test]
async fn test_primary_login_with_auth_and_bind() {
    rootwire_transport::logging::init("rootwire_transport=debug");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let session = [0x5au8; 16];

    let server = tokio::spawn(async move {
        // primary sub-stream
        let (mut primary, _) = listener.accept().await.unwrap();
        let protocol = serve_handshake(&mut primary).await;
        assert!(matches!(protocol, RequestBody::Protocol { expect: 3, .. }));

        let login = read_request(&mut primary).await;
        match login.body {
            RequestBody::Login { username, cgi, .. } => {
                assert_eq!(&username[..5], b"alice");
                assert!(cgi.starts_with(b"xrd.cc="));
            }
            other => panic!("expected login, got {:?}", other),
        }
        let mut body = session.to_vec();
        body.extend_from_slice(b"&P=unix");
        respond(&mut primary, [0, 0], ResponseBody::Ok(Bytes::from(body))).await;

        let auth = read_request(&mut primary).await;
        match auth.body {
            RequestBody::Auth {
                credtype,
                credentials,
            } => {
                assert_eq!(&credtype, b"unix");
                assert!(credentials.starts_with(b"unix\0alice "));
            }
            other => panic!("expected auth, got {:?}", other),
        }
        respond(&mut primary, [0, 0], ResponseBody::Ok(Bytes::new())).await;

        // parallel sub-stream
        let (mut parallel, _) = listener.accept().await.unwrap();
        let protocol = serve_handshake(&mut parallel).await;
        assert!(matches!(protocol, RequestBody::Protocol { expect: 1, .. }));
        let bind = read_request(&mut parallel).await;
        assert_eq!(bind.body, RequestBody::Bind { sessid: session });
        respond(&mut parallel, [0, 0], ResponseBody::Ok(Bytes::from_static(&[7]))).await;

        // one regular request on the primary
        let ping = read_request(&mut primary).await;
        assert_eq!(ping.body, RequestBody::Ping);
        respond(&mut primary, ping.stream_id, ResponseBody::Ok(Bytes::new())).await;
        (primary, parallel)
    });

    let channel = channel(port);
    let mut primary = SubStreamConnection::connect(&channel, 0).await.unwrap();
    assert!(channel.handshake_done(0));
    assert_eq!(channel.session_id(), session);
    assert_eq!(
        channel.query(ChannelQuery::Auth),
        QueryAnswer::Auth("unix".to_string())
    );
    assert_eq!(channel.substream_count(), 2);
    assert_eq!(channel.bind_preference().as_deref(), Some("10.0.0.2"));

    let parallel = SubStreamConnection::connect(&channel, 1).await.unwrap();
    assert_eq!(parallel.substream(), 1);
    assert_eq!(channel.stream_status(1), Some(StreamStatus::Connected));
    assert_eq!(channel.path_id(1), Some(7));
    assert_eq!(channel.connected_data_streams(), 1);

    let sid = channel.allocate_sid().unwrap();
    primary
        .send_request(&channel, &ClientRequest::new(sid, RequestBody::Ping))
        .await
        .unwrap();
    let (rsp, action) = primary.recv_response(&channel).await.unwrap();
    assert_eq!(rsp.stream_id, sid);
    assert_eq!(action, ReceivedAction::NoAction);
    channel.release_sid(sid);

    let _sockets = server.await.unwrap();
    let snap = channel.metrics().snapshot();
    assert_eq!(snap.handshakes_completed, 2);
    assert_eq!(snap.binds_completed, 1);
    assert_eq!(snap.auth_attempts, 1);
    assert!(snap.bytes_sent > 0);
    assert!(snap.bytes_received > 0);
}

#[tokio::test]
async fn test_login_rejection_breaks_primary() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut primary, _) = listener.accept().await.unwrap();
        serve_handshake(&mut primary).await;
        read_request(&mut primary).await;
        respond(
            &mut primary,
            [0, 0],
            ResponseBody::Error {
                errnum: 3010,
                message: "not authorized".to_string(),
            },
        )
        .await;
        primary
    });

    let channel = channel(port);
    let err = SubStreamConnection::connect(&channel, 0).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.code().as_str(), "errLoginFailed");
    assert_eq!(channel.stream_status(0), Some(StreamStatus::Broken));
    assert_eq!(channel.metrics().snapshot().handshakes_failed, 1);
    let _socket = server.await.unwrap();
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        socket
    });

    let config = TransportConfig {
        request_timeout_secs: 1,
        ..Default::default()
    };
    let channel = Channel::new(
        ChannelUrl::new("127.0.0.1", port),
        config,
        Arc::new(ProviderRegistry::new()),
    );
    let err = SubStreamConnection::connect(&channel, 0).await.unwrap_err();
    assert_eq!(err.code().as_str(), "errSocketTimeout");
    assert_eq!(channel.stream_status(0), Some(StreamStatus::Broken));
    let _ = server.await;
}
