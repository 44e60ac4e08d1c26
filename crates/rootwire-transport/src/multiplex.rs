//! Sub-stream selection for outgoing requests.

use rand::seq::SliceRandom;
use tracing::debug;

use crate::channel::{Channel, ChannelState, PathId, StreamStatus};
use crate::codec::{decode_request, encode_request, PgReadArgs, ReadArgs, RequestBody};
use crate::config::DownlinkPolicy;
use crate::error::Result;
use crate::message::Message;
use crate::protocol::{RequestId, REQUEST_HEADER_SIZE};

fn request_id_of(msg: &Message) -> Option<RequestId> {
    let wire = msg.as_slice();
    if wire.len() < REQUEST_HEADER_SIZE {
        return None;
    }
    RequestId::from_u16(u16::from_be_bytes([wire[2], wire[3]]))
}

fn pick_downlink(state: &ChannelState, policy: DownlinkPolicy) -> u16 {
    let connected: Vec<u16> = state
        .substreams
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, s)| s.status == StreamStatus::Connected)
        .filter_map(|(i, _)| u16::try_from(i).ok())
        .collect();

    match policy {
        DownlinkPolicy::Random => connected
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(0),
        DownlinkPolicy::LeastLoaded => connected
            .iter()
            .copied()
            .min_by_key(|i| (state.substreams[usize::from(*i)].outstanding, *i))
            .unwrap_or(0),
    }
}

impl Channel {
    /// Chooses the `(uplink, downlink)` sub-streams of a marshalled request
    /// and, for reads, stamps the downlink's path id into the message so
    /// that the server answers on that sub-stream.
    ///
    /// Writes always stay on the primary and are never modified. Other
    /// non-read requests honor the hinted uplink but are answered on the
    /// primary.
    pub fn multiplex(&self, msg: &mut Message, hint: Option<PathId>) -> Result<PathId> {
        let request_id = request_id_of(msg);
        if matches!(
            request_id,
            Some(RequestId::Write | RequestId::Writev | RequestId::Pgwrite)
        ) {
            return Ok(PathId::default());
        }

        let mut state = self.lock();
        let count = state.substreams.len();
        if !state.server_flags.is_data_server() || count <= 1 {
            return Ok(PathId::default());
        }

        let mut path = match hint {
            Some(hint) => hint,
            None => PathId::new(0, pick_downlink(&state, self.config().downlink_policy)),
        };
        if usize::from(path.up) >= count {
            debug!(stream = %state.stream_name, up = path.up, "uplink out of range, using 0");
            path.up = 0;
        }
        if usize::from(path.down) >= count {
            debug!(stream = %state.stream_name, down = path.down, "downlink out of range, using 0");
            path.down = 0;
        }

        if !matches!(
            request_id,
            Some(RequestId::Read | RequestId::Pgread | RequestId::Readv)
        ) {
            path.down = 0;
            return Ok(path);
        }

        let path_id = state.substreams[usize::from(path.down)].path_id;
        let mut request = decode_request(msg.as_slice())?;
        match &mut request.body {
            RequestBody::Read { args, .. } => {
                args.get_or_insert_with(ReadArgs::default).path_id = path_id;
            }
            RequestBody::Pgread { args, .. } => {
                args.get_or_insert_with(PgReadArgs::default).path_id = path_id;
            }
            RequestBody::Readv { path_id: field, .. } => *field = path_id,
            _ => {}
        }
        let description = msg.description().map(str::to_string);
        *msg = encode_request(&request)?;
        if let Some(description) = description {
            msg.set_description(description);
        }

        if path.down != 0 {
            state.substreams[usize::from(path.down)].outstanding += 1;
            self.metrics().inc_requests_multiplexed();
        }
        debug!(
            stream = %state.stream_name,
            path = %path,
            path_id = path_id,
            "multiplexed read request"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::channel_with;
    use crate::codec::{ClientRequest, ReadChunk, ServerResponse, ResponseBody};
    use crate::config::TransportConfig;
    use crate::protocol::ServerFlags;
    use bytes::Bytes;
    use std::collections::HashSet;

    fn data_server(substreams: u16, connected: &[(usize, u8)]) -> Channel {
        let channel = channel_with(substreams);
        {
            let mut state = channel.lock();
            state.server_flags = ServerFlags::from_bits(ServerFlags::IS_SERVER);
            state.substreams[0].status = StreamStatus::Connected;
            for (index, path_id) in connected {
                state.substreams[*index].status = StreamStatus::Connected;
                state.substreams[*index].path_id = *path_id;
            }
        }
        channel
    }

    fn read_msg() -> Message {
        encode_request(&ClientRequest::new(
            [0, 1],
            RequestBody::Read {
                fhandle: [0, 0, 0, 42],
                offset: 4096,
                rlen: 1024,
                args: None,
            },
        ))
        .unwrap()
    }

    #[test]
    fn test_read_spreads_over_connected_substreams() {
        let channel = data_server(3, &[(1, 11), (2, 22)]);
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let mut msg = read_msg();
            let path = channel.multiplex(&mut msg, None).unwrap();
            assert_eq!(path.up, 0);
            assert!(path.down == 1 || path.down == 2);
            seen.insert(path.down);

            let expected = if path.down == 1 { 11 } else { 22 };
            match decode_request(msg.as_slice()).unwrap().body {
                RequestBody::Read {
                    fhandle,
                    offset,
                    rlen,
                    args,
                } => {
                    assert_eq!(fhandle, [0, 0, 0, 42]);
                    assert_eq!(offset, 4096);
                    assert_eq!(rlen, 1024);
                    assert_eq!(args.unwrap().path_id, expected);
                }
                other => panic!("expected a read, got {:?}", other),
            }
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(channel.metrics().snapshot().requests_multiplexed, 64);
    }

    #[test]
    fn test_write_is_untouched() {
        let channel = data_server(3, &[(1, 11), (2, 22)]);
        let mut msg = encode_request(&ClientRequest::new(
            [0, 2],
            RequestBody::Write {
                fhandle: [0, 0, 0, 1],
                offset: 0,
                path_id: 0,
                data: Bytes::from_static(b"payload"),
            },
        ))
        .unwrap();
        let before = msg.clone();
        let path = channel.multiplex(&mut msg, Some(PathId::new(1, 2))).unwrap();
        assert_eq!(path, PathId::new(0, 0));
        assert_eq!(msg, before);
    }

    #[test]
    fn test_not_a_data_server() {
        let channel = channel_with(3);
        let mut msg = read_msg();
        let before = msg.clone();
        assert_eq!(channel.multiplex(&mut msg, None).unwrap(), PathId::default());
        assert_eq!(msg, before);
    }

    #[test]
    fn test_no_connected_secondaries_falls_back_to_primary() {
        let channel = data_server(3, &[]);
        let mut msg = read_msg();
        assert_eq!(channel.multiplex(&mut msg, None).unwrap(), PathId::new(0, 0));
        assert_eq!(channel.metrics().snapshot().requests_multiplexed, 0);
    }

    #[test]
    fn test_out_of_range_hint_is_clamped() {
        let channel = data_server(2, &[(1, 5)]);
        let mut msg = read_msg();
        let path = channel.multiplex(&mut msg, Some(PathId::new(7, 9))).unwrap();
        assert_eq!(path, PathId::new(0, 0));
    }

    #[test]
    fn test_readv_gets_path_id() {
        let channel = data_server(2, &[(1, 5)]);
        let chunks = vec![ReadChunk {
            fhandle: [0, 0, 0, 3],
            rlen: 10,
            offset: 20,
        }];
        let mut msg = encode_request(&ClientRequest::new(
            [0, 3],
            RequestBody::Readv {
                path_id: 0,
                chunks: chunks.clone(),
            },
        ))
        .unwrap();
        let path = channel.multiplex(&mut msg, None).unwrap();
        assert_eq!(path, PathId::new(0, 1));
        assert_eq!(
            decode_request(msg.as_slice()).unwrap().body,
            RequestBody::Readv { path_id: 5, chunks }
        );
    }

    #[test]
    fn test_other_requests_answer_on_primary() {
        let channel = data_server(2, &[(1, 5)]);
        let mut msg = encode_request(&ClientRequest::new(
            [0, 4],
            RequestBody::Stat {
                options: 0,
                fhandle: [0; 4],
                path: Bytes::from_static(b"/data"),
            },
        ))
        .unwrap();
        let before = msg.clone();
        let path = channel.multiplex(&mut msg, Some(PathId::new(1, 1))).unwrap();
        assert_eq!(path, PathId::new(1, 0));
        assert_eq!(msg, before);
    }

    fn least_loaded_channel() -> Channel {
        let config = TransportConfig {
            substreams_per_channel: 3,
            downlink_policy: DownlinkPolicy::LeastLoaded,
            ..Default::default()
        };
        let channel = Channel::new(
            crate::channel::ChannelUrl::new("srv", 1094),
            config,
            std::sync::Arc::new(crate::auth::ProviderRegistry::new()),
        );
        {
            let mut state = channel.lock();
            state.server_flags = ServerFlags::from_bits(ServerFlags::IS_SERVER);
            for i in 1..3 {
                state.substreams[i].status = StreamStatus::Connected;
                state.substreams[i].path_id = i as u8;
            }
        }
        channel
    }

    #[test]
    fn test_least_loaded_policy() {
        let channel = least_loaded_channel();
        let first = channel.multiplex(&mut read_msg(), None).unwrap();
        let second = channel.multiplex(&mut read_msg(), None).unwrap();
        assert_eq!(first.down, 1);
        assert_eq!(second.down, 2);

        // a reply on sub-stream 2 makes it the least loaded again
        let reply = ServerResponse::new([0, 1], ResponseBody::Ok(Bytes::new()));
        channel.message_received(&reply, 2);
        assert_eq!(channel.multiplex(&mut read_msg(), None).unwrap().down, 2);
    }

    #[test]
    fn test_partial_replies_keep_request_in_flight() {
        let channel = least_loaded_channel();
        channel.multiplex(&mut read_msg(), None).unwrap();
        channel.multiplex(&mut read_msg(), None).unwrap();
        assert_eq!(channel.lock().substreams[2].outstanding, 1);

        let partial =
            ServerResponse::new([0, 1], ResponseBody::OkSoFar(Bytes::from_static(b"x")));
        channel.message_received(&partial, 2);
        let waitresp = ServerResponse::new([0, 1], ResponseBody::WaitResp { seconds: 1 });
        channel.message_received(&waitresp, 2);
        assert_eq!(channel.lock().substreams[2].outstanding, 1);

        let last = ServerResponse::new([0, 1], ResponseBody::Ok(Bytes::from_static(b"y")));
        channel.message_received(&last, 2);
        assert_eq!(channel.lock().substreams[2].outstanding, 0);
    }
}
