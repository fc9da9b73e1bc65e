// Copyright 2020 Joyent, Inc.

//! The control protocol spoken between instances.
//!
//! Every message travels in a frame made of a big-endian `u32` body length
//! followed by the body. A request body is `u64 seq | u8 op | arguments` and a
//! response body is `u64 seq | u8 code | payload`. The sequence number of a
//! response always echoes the request it answers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Error;
use crate::id::{CompoundId, InstanceId, NodeId};

/// Upper bound on the body of a single frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const FRAME_HEADER_LEN: usize = 4;
const HEADER_LEN: usize = 9;

/// Names an open logical channel to a node hosted by a remote instance.
pub type ChannelId = u64;

/// The operation selector carried by every request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Op {
    GetInstanceStatus = 1,
    OpenChannel = 2,
    CloseChannel = 3,
    Invoke = 4,
    GetRoutingStatus = 5,
    CloseChannelsFrom = 6,
}

impl Op {
    pub fn from_u8(value: u8) -> Option<Op> {
        match value {
            1 => Some(Op::GetInstanceStatus),
            2 => Some(Op::OpenChannel),
            3 => Some(Op::CloseChannel),
            4 => Some(Op::Invoke),
            5 => Some(Op::GetRoutingStatus),
            6 => Some(Op::CloseChannelsFrom),
            _ => None,
        }
    }
}

/// Outcome of a request as reported by the remote side.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseCode {
    Ok = 0,
    UnknownCommand = 1,
    UnknownNode = 2,
    UnknownChannel = 3,
    DispatchFailed = 4,
    Malformed = 5,
}

impl ResponseCode {
    pub fn from_u8(value: u8) -> Option<ResponseCode> {
        match value {
            0 => Some(ResponseCode::Ok),
            1 => Some(ResponseCode::UnknownCommand),
            2 => Some(ResponseCode::UnknownNode),
            3 => Some(ResponseCode::UnknownChannel),
            4 => Some(ResponseCode::DispatchFailed),
            5 => Some(ResponseCode::Malformed),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ResponseCode::Ok => "ok",
            ResponseCode::UnknownCommand => "unknown command",
            ResponseCode::UnknownNode => "unknown node",
            ResponseCode::UnknownChannel => "unknown channel",
            ResponseCode::DispatchFailed => "dispatch failed",
            ResponseCode::Malformed => "malformed request",
        };
        fmt.write_str(name)
    }
}

/// A control command together with its arguments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    GetInstanceStatus,
    /// Open a channel to `node` on behalf of the instance `origin`.
    OpenChannel { node: NodeId, origin: InstanceId },
    CloseChannel(ChannelId),
    Invoke { channel: ChannelId, payload: Vec<u8> },
    GetRoutingStatus,
    /// Close every channel opened on behalf of the given instance.
    CloseChannelsFrom(InstanceId),
}

impl Command {
    pub fn op(&self) -> Op {
        match self {
            Command::GetInstanceStatus => Op::GetInstanceStatus,
            Command::OpenChannel { .. } => Op::OpenChannel,
            Command::CloseChannel(_) => Op::CloseChannel,
            Command::Invoke { .. } => Op::Invoke,
            Command::GetRoutingStatus => Op::GetRoutingStatus,
            Command::CloseChannelsFrom(_) => Op::CloseChannelsFrom,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub seq: u64,
    pub command: Command,
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(HEADER_LEN);
        write_header(&mut body, self.seq, self.command.op() as u8);
        match &self.command {
            Command::GetInstanceStatus | Command::GetRoutingStatus => (),
            Command::OpenChannel { node, origin } => {
                write_id(&mut body, node);
                write_id(&mut body, origin);
            }
            Command::CloseChannel(channel) => write_u64(&mut body, *channel),
            Command::Invoke { channel, payload } => {
                write_u64(&mut body, *channel);
                body.extend_from_slice(payload);
            }
            Command::CloseChannelsFrom(origin) => write_id(&mut body, origin),
        }
        body
    }

    /// Decode a complete request body. An unknown operation is reported as a
    /// protocol error; servers that want to answer it should look at
    /// [`decode_header`] first.
    pub fn decode(body: &[u8]) -> Result<Request, Error> {
        let (seq, raw_op) = decode_header(body)?;
        let op = Op::from_u8(raw_op).ok_or_else(|| {
            Error::Protocol(format!("unknown operation {}", raw_op))
        })?;
        let mut cursor = Cursor::new(&body[HEADER_LEN..]);
        let command = match op {
            Op::GetInstanceStatus => Command::GetInstanceStatus,
            Op::OpenChannel => {
                let node = read_id(&mut cursor)?;
                let origin = read_id(&mut cursor)?;
                Command::OpenChannel { node, origin }
            }
            Op::CloseChannel => Command::CloseChannel(read_u64(&mut cursor)?),
            Op::Invoke => {
                let channel = read_u64(&mut cursor)?;
                Command::Invoke {
                    channel,
                    payload: read_rest(&mut cursor),
                }
            }
            Op::GetRoutingStatus => Command::GetRoutingStatus,
            Op::CloseChannelsFrom => {
                Command::CloseChannelsFrom(read_id(&mut cursor)?)
            }
        };
        Ok(Request { seq, command })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub seq: u64,
    pub code: ResponseCode,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn ok(seq: u64, payload: Vec<u8>) -> Self {
        Response {
            seq,
            code: ResponseCode::Ok,
            payload,
        }
    }

    pub fn failure(seq: u64, code: ResponseCode, message: &str) -> Self {
        Response {
            seq,
            code,
            payload: message.as_bytes().to_vec(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(HEADER_LEN + self.payload.len());
        write_header(&mut body, self.seq, self.code as u8);
        body.extend_from_slice(&self.payload);
        body
    }

    pub fn decode(body: &[u8]) -> Result<Response, Error> {
        let (seq, raw_code) = decode_header(body)?;
        let code = ResponseCode::from_u8(raw_code).ok_or_else(|| {
            Error::Protocol(format!("unknown response code {}", raw_code))
        })?;
        Ok(Response {
            seq,
            code,
            payload: body[HEADER_LEN..].to_vec(),
        })
    }

    /// Turn a failure response into `Error::Remote`, passing the payload of a
    /// successful one through.
    pub fn into_result(self) -> Result<Vec<u8>, Error> {
        match self.code {
            ResponseCode::Ok => Ok(self.payload),
            code => Err(Error::Remote {
                code,
                message: String::from_utf8_lossy(&self.payload).into_owned(),
            }),
        }
    }
}

/// Extract the sequence number and the selector byte (op for requests,
/// response code for responses) without decoding the rest of the body.
pub fn decode_header(body: &[u8]) -> Result<(u64, u8), Error> {
    if body.len() < HEADER_LEN {
        return Err(Error::Protocol(format!(
            "short message header ({} bytes)",
            body.len()
        )));
    }
    let mut cursor = Cursor::new(body);
    let seq = read_u64(&mut cursor)?;
    let selector = cursor.read_u8()?;
    Ok((seq, selector))
}

/// The payload of a status reply: which nodes an instance hosts right now.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceStatus {
    pub instance_id: InstanceId,
    pub nodes: BTreeSet<NodeId>,
}

impl InstanceStatus {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        write_id(&mut payload, &self.instance_id);
        // Infallible on a Vec.
        let _ = payload.write_u32::<BigEndian>(self.nodes.len() as u32);
        for node in &self.nodes {
            write_id(&mut payload, node);
        }
        payload
    }

    pub fn decode(payload: &[u8]) -> Result<InstanceStatus, Error> {
        let mut cursor = Cursor::new(payload);
        let instance_id = read_id(&mut cursor)?;
        let count = read_count(&mut cursor)?;
        let mut nodes = BTreeSet::new();
        for _ in 0..count {
            nodes.insert(read_id(&mut cursor)?);
        }
        Ok(InstanceStatus { instance_id, nodes })
    }
}

/// One open channel: the node it leads to and the instance it was opened
/// for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Route {
    pub node: NodeId,
    pub origin: InstanceId,
}

/// The payload of a routing status reply: every channel open on an
/// instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoutingStatus {
    pub instance_id: InstanceId,
    pub routes: BTreeMap<ChannelId, Route>,
}

impl RoutingStatus {
    /// The open channels grouped by the node they lead to.
    pub fn channels_by_node(&self) -> BTreeMap<NodeId, BTreeSet<ChannelId>> {
        let mut by_node: BTreeMap<NodeId, BTreeSet<ChannelId>> = BTreeMap::new();
        for (channel, route) in &self.routes {
            by_node
                .entry(route.node.clone())
                .or_default()
                .insert(*channel);
        }
        by_node
    }

    /// The channels opened on behalf of `origin`.
    pub fn channels_from(&self, origin: &InstanceId) -> BTreeSet<ChannelId> {
        self.routes
            .iter()
            .filter(|(_, route)| &route.origin == origin)
            .map(|(channel, _)| *channel)
            .collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        write_id(&mut payload, &self.instance_id);
        let _ = payload.write_u32::<BigEndian>(self.routes.len() as u32);
        for (channel, route) in &self.routes {
            write_u64(&mut payload, *channel);
            write_id(&mut payload, &route.node);
            write_id(&mut payload, &route.origin);
        }
        payload
    }

    pub fn decode(payload: &[u8]) -> Result<RoutingStatus, Error> {
        let mut cursor = Cursor::new(payload);
        let instance_id = read_id(&mut cursor)?;
        let count = read_count(&mut cursor)?;
        let mut routes = BTreeMap::new();
        for _ in 0..count {
            let channel = read_u64(&mut cursor)?;
            let node = read_id(&mut cursor)?;
            let origin = read_id(&mut cursor)?;
            routes.insert(channel, Route { node, origin });
        }
        Ok(RoutingStatus {
            instance_id,
            routes,
        })
    }
}

/// The payload of a successful `CloseChannelsFrom` reply: how many channels
/// were closed.
pub fn encode_count(count: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4);
    let _ = payload.write_u32::<BigEndian>(count);
    payload
}

pub fn decode_count(payload: &[u8]) -> Result<u32, Error> {
    read_count(&mut Cursor::new(payload))
}

/// The payload of a successful `OpenChannel` reply.
pub fn encode_channel_id(channel: ChannelId) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    write_u64(&mut payload, channel);
    payload
}

pub fn decode_channel_id(payload: &[u8]) -> Result<ChannelId, Error> {
    read_u64(&mut Cursor::new(payload))
}

/// Wrap a message body into a frame.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    let _ = framed.write_u32::<BigEndian>(body.len() as u32);
    framed.extend_from_slice(body);
    framed
}

/// Remove the first complete frame from `buf` and return its body, or
/// `Ok(None)` if more bytes are needed.
pub fn take_frame(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, Error> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let len = Cursor::new(&buf[..FRAME_HEADER_LEN]).read_u32::<BigEndian>()?
        as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    if buf.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }
    let body = buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
    buf.drain(..FRAME_HEADER_LEN + len);
    Ok(Some(body))
}

/// True when `buf` starts with a complete frame.
pub fn has_frame(buf: &[u8]) -> bool {
    if buf.len() < FRAME_HEADER_LEN {
        return false;
    }
    match Cursor::new(&buf[..FRAME_HEADER_LEN]).read_u32::<BigEndian>() {
        Ok(len) => {
            let len = len as usize;
            len > MAX_FRAME_LEN || buf.len() >= FRAME_HEADER_LEN + len
        }
        Err(_) => false,
    }
}

fn write_header(body: &mut Vec<u8>, seq: u64, selector: u8) {
    write_u64(body, seq);
    body.push(selector);
}

fn write_u64(body: &mut Vec<u8>, value: u64) {
    let _ = body.write_u64::<BigEndian>(value);
}

fn write_id<T: CompoundId>(body: &mut Vec<u8>, id: &T) {
    let bytes = id.canonical_bytes();
    let _ = body.write_u16::<BigEndian>(bytes.len() as u16);
    body.extend_from_slice(bytes);
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64, Error> {
    cursor
        .read_u64::<BigEndian>()
        .map_err(|e| Error::Protocol(format!("truncated message: {}", e)))
}

fn read_count(cursor: &mut Cursor<&[u8]>) -> Result<u32, Error> {
    cursor
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Protocol(format!("truncated count: {}", e)))
}

fn read_id<T: CompoundId>(cursor: &mut Cursor<&[u8]>) -> Result<T, Error> {
    let len = cursor
        .read_u16::<BigEndian>()
        .map_err(|e| Error::Protocol(format!("identifier length: {}", e)))?;
    let mut bytes = vec![0u8; len as usize];
    cursor
        .read_exact(&mut bytes)
        .map_err(|e| Error::Protocol(format!("identifier: {}", e)))?;
    T::from_bytes(&bytes)
}

fn read_rest(cursor: &mut Cursor<&[u8]>) -> Vec<u8> {
    let mut rest = Vec::new();
    let _ = cursor.read_to_end(&mut rest);
    rest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ApplicationId;

    fn node() -> NodeId {
        NodeId::new(&InstanceId::new_random(), &ApplicationId::new_random())
    }

    #[test]
    fn header_is_readable_without_body() {
        let request = Request {
            seq: 42,
            command: Command::Invoke {
                channel: 7,
                payload: b"echo".to_vec(),
            },
        };
        let body = request.encode();
        assert_eq!(decode_header(&body).unwrap(), (42, Op::Invoke as u8));
        assert_eq!(Request::decode(&body).unwrap(), request);
    }

    #[test]
    fn open_channel_carries_node_and_origin() {
        let node_id = node();
        let origin = InstanceId::new_random();
        let request = Request {
            seq: 1,
            command: Command::OpenChannel {
                node: node_id.clone(),
                origin: origin.clone(),
            },
        };
        match Request::decode(&request.encode()).unwrap().command {
            Command::OpenChannel { node, origin: o } => {
                assert_eq!(node, node_id);
                assert_eq!(o, origin);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let close = Request {
            seq: 2,
            command: Command::CloseChannelsFrom(origin.clone()),
        };
        assert_eq!(decode_header(&close.encode()).unwrap().1, 6);
        assert_eq!(Request::decode(&close.encode()).unwrap(), close);
    }

    #[test]
    fn routing_status_groups_channels() {
        let a = node();
        let b = node();
        let origin = InstanceId::new_random();
        let other = InstanceId::new_random();
        let route = |node: &NodeId, origin: &InstanceId| Route {
            node: node.clone(),
            origin: origin.clone(),
        };
        let status = RoutingStatus {
            instance_id: InstanceId::new_random(),
            routes: vec![
                (1, route(&a, &origin)),
                (2, route(&b, &origin)),
                (3, route(&a, &other)),
            ]
            .into_iter()
            .collect(),
        };
        let decoded = RoutingStatus::decode(&status.encode()).unwrap();
        assert_eq!(decoded, status);

        let by_node = decoded.channels_by_node();
        assert_eq!(by_node[&a], vec![1, 3].into_iter().collect::<BTreeSet<_>>());
        assert_eq!(by_node[&b], vec![2].into_iter().collect::<BTreeSet<_>>());
        assert_eq!(
            decoded.channels_from(&origin),
            vec![1, 2].into_iter().collect::<BTreeSet<_>>()
        );
        assert!(RoutingStatus::decode(&status.encode()[..20]).is_err());
    }

    #[test]
    fn unknown_op_and_short_header() {
        let mut body = Vec::new();
        write_header(&mut body, 9, 200);
        assert_eq!(decode_header(&body).unwrap(), (9, 200));
        assert!(Request::decode(&body).is_err());
        assert!(decode_header(&[0, 1, 2]).is_err());
    }

    #[test]
    fn failure_response_becomes_remote_error() {
        let response =
            Response::failure(3, ResponseCode::UnknownNode, "no such node");
        let decoded = Response::decode(&response.encode()).unwrap();
        match decoded.into_result() {
            Err(Error::Remote { code, message }) => {
                assert_eq!(code, ResponseCode::UnknownNode);
                assert_eq!(message, "no such node");
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn status_payload() {
        let status = InstanceStatus {
            instance_id: InstanceId::new_random(),
            nodes: vec![node(), node(), node()].into_iter().collect(),
        };
        assert_eq!(InstanceStatus::decode(&status.encode()).unwrap(), status);

        let empty = InstanceStatus {
            instance_id: InstanceId::new_random(),
            nodes: BTreeSet::new(),
        };
        assert_eq!(InstanceStatus::decode(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn frames_split_on_boundaries() {
        let mut buf = frame(b"first");
        buf.extend_from_slice(&frame(b"second"));
        buf.extend_from_slice(&frame(b"thi")[..5]);

        assert!(has_frame(&buf));
        assert_eq!(take_frame(&mut buf).unwrap().unwrap(), b"first");
        assert_eq!(take_frame(&mut buf).unwrap().unwrap(), b"second");
        assert!(!has_frame(&buf));
        assert_eq!(take_frame(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = Vec::new();
        let _ = buf.write_u32::<BigEndian>((MAX_FRAME_LEN + 1) as u32);
        assert!(take_frame(&mut buf).is_err());
    }
}
