// Copyright 2020 Joyent, Inc.

//! The serving half of the control protocol.
//!
//! A `ControlServer` holds the routing table of one instance: which nodes
//! are bound locally and which logical channels peers have opened to them.
//! Requests are answered on the thread context that owns the connection they
//! arrived on.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use mio::Token;
use slog::{debug, trace, warn, Logger};

use crate::connection::AsyncConnection;
use crate::error::Error;
use crate::id::{InstanceId, NodeId};
use crate::protocol::{
    decode_header, encode_channel_id, encode_count, ChannelId, Command,
    InstanceStatus, Op, Route, RoutingStatus,
    Request, Response, ResponseCode,
};
use crate::thread_context::types::Event;
use crate::thread_context::LoopContext;

/// Handles invocation payloads addressed to a locally bound node.
///
/// Called on an event loop thread, so implementations must not block.
pub trait RequestDispatcher: Send + Sync {
    fn dispatch(&self, node: &NodeId, payload: &[u8]) -> Result<Vec<u8>, String>;
}

impl<F> RequestDispatcher for F
where
    F: Fn(&NodeId, &[u8]) -> Result<Vec<u8>, String> + Send + Sync,
{
    fn dispatch(&self, node: &NodeId, payload: &[u8]) -> Result<Vec<u8>, String> {
        self(node, payload)
    }
}

struct ServerState {
    instance_id: InstanceId,
    bindings: RwLock<HashMap<NodeId, Arc<dyn RequestDispatcher>>>,
    channels: Mutex<HashMap<ChannelId, Route>>,
    next_channel: AtomicU64,
    log: Logger,
}

/// Routing table and request handler for one instance. Clones share state.
#[derive(Clone)]
pub struct ControlServer {
    state: Arc<ServerState>,
}

impl ControlServer {
    pub fn new(instance_id: InstanceId, log: Logger) -> Self {
        ControlServer {
            state: Arc::new(ServerState {
                instance_id,
                bindings: RwLock::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                next_channel: AtomicU64::new(1),
                log,
            }),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.state.instance_id
    }

    /// Route traffic for `node` to `dispatcher`.
    pub fn bind(
        &self,
        node: NodeId,
        dispatcher: Arc<dyn RequestDispatcher>,
    ) -> Result<(), Error> {
        let mut bindings = self
            .state
            .bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if bindings.contains_key(&node) {
            return Err(Error::BindingExists(node));
        }
        debug!(self.state.log, "binding node"; "node" => node.to_string());
        bindings.insert(node, dispatcher);
        Ok(())
    }

    /// Remove the binding for `node` and every channel opened to it.
    /// Returns false if the node was not bound.
    pub fn unbind(&self, node: &NodeId) -> bool {
        let removed = self
            .state
            .bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node)
            .is_some();
        if removed {
            self.channels_lock().retain(|_, route| &route.node != node);
            debug!(self.state.log, "unbound node"; "node" => node.to_string());
        }
        removed
    }

    pub fn bound_nodes(&self) -> BTreeSet<NodeId> {
        self.state
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            instance_id: self.state.instance_id.clone(),
            nodes: self.bound_nodes(),
        }
    }

    pub fn open_channels(&self) -> usize {
        self.channels_lock().len()
    }

    /// Every open channel with the node it leads to and the instance it
    /// was opened for.
    pub fn routing_status(&self) -> RoutingStatus {
        RoutingStatus {
            instance_id: self.state.instance_id.clone(),
            routes: self
                .channels_lock()
                .iter()
                .map(|(channel, route)| (*channel, route.clone()))
                .collect(),
        }
    }

    /// Close the channels opened on behalf of `origin`. Returns how many
    /// were closed.
    pub fn close_channels_from(&self, origin: &InstanceId) -> usize {
        let mut channels = self.channels_lock();
        let before = channels.len();
        channels.retain(|_, route| &route.origin != origin);
        let closed = before - channels.len();
        if closed > 0 {
            debug!(self.state.log, "closed channels";
                "origin" => origin.to_string(), "count" => closed);
        }
        closed
    }

    fn channels_lock(&self) -> MutexGuard<HashMap<ChannelId, Route>> {
        self.state
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Listen for peers on `addr` from the given loop.
    pub fn listen(
        &self,
        lc: &mut LoopContext,
        addr: SocketAddr,
    ) -> io::Result<(Token, SocketAddr)> {
        let server = self.clone();
        lc.listen(addr, move |connection| server.serve(connection))
    }

    /// Answer every request arriving on `connection`.
    pub fn serve(&self, connection: &mut AsyncConnection) {
        trace!(self.state.log, "serving connection";
            "connection" => connection.name());
        connection.set_events(&[Event::Read, Event::Error]);
        let server = self.clone();
        connection.on_read(move |c| {
            while let Some(body) = c.recv() {
                match server.handle_request(&body) {
                    Some(response) => c.send(&response.encode()),
                    None => {
                        warn!(server.state.log, "unreadable request header";
                            "connection" => c.name());
                        c.close();
                        return;
                    }
                }
            }
        });
    }

    /// Produce the response to one request body, or `None` when not even the
    /// header can be read and there is nobody to answer.
    pub fn handle_request(&self, body: &[u8]) -> Option<Response> {
        let (seq, raw_op) = decode_header(body).ok()?;
        if Op::from_u8(raw_op).is_none() {
            return Some(Response::failure(
                seq,
                ResponseCode::UnknownCommand,
                &format!("unknown operation {}", raw_op),
            ));
        }
        let request = match Request::decode(body) {
            Ok(request) => request,
            Err(e) => {
                return Some(Response::failure(
                    seq,
                    ResponseCode::Malformed,
                    &e.to_string(),
                ));
            }
        };
        Some(self.execute(request))
    }

    fn execute(&self, request: Request) -> Response {
        let seq = request.seq;
        match request.command {
            Command::GetInstanceStatus => {
                Response::ok(seq, self.status().encode())
            }
            Command::OpenChannel { node, origin } => {
                self.open_channel(seq, node, origin)
            }
            Command::CloseChannel(channel) => {
                match self.channels_lock().remove(&channel) {
                    Some(_) => Response::ok(seq, Vec::new()),
                    None => unknown_channel(seq, channel),
                }
            }
            Command::Invoke { channel, payload } => {
                self.invoke(seq, channel, &payload)
            }
            Command::GetRoutingStatus => {
                Response::ok(seq, self.routing_status().encode())
            }
            Command::CloseChannelsFrom(origin) => {
                let closed = self.close_channels_from(&origin);
                Response::ok(seq, encode_count(closed as u32))
            }
        }
    }

    fn open_channel(
        &self,
        seq: u64,
        node: NodeId,
        origin: InstanceId,
    ) -> Response {
        let bound = self
            .state
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&node);
        if !bound {
            return Response::failure(
                seq,
                ResponseCode::UnknownNode,
                &format!("node {} is not bound here", node),
            );
        }
        let channel = self.state.next_channel.fetch_add(1, Ordering::Relaxed);
        self.channels_lock().insert(channel, Route { node, origin });
        Response::ok(seq, encode_channel_id(channel))
    }

    fn invoke(&self, seq: u64, channel: ChannelId, payload: &[u8]) -> Response {
        let node = self
            .channels_lock()
            .get(&channel)
            .map(|route| route.node.clone());
        let node = match node {
            Some(node) => node,
            None => return unknown_channel(seq, channel),
        };
        let dispatcher = self
            .state
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node)
            .cloned();
        match dispatcher {
            Some(dispatcher) => match dispatcher.dispatch(&node, payload) {
                Ok(reply) => Response::ok(seq, reply),
                Err(message) => {
                    Response::failure(seq, ResponseCode::DispatchFailed, &message)
                }
            },
            None => unknown_channel(seq, channel),
        }
    }
}

fn unknown_channel(seq: u64, channel: ChannelId) -> Response {
    Response::failure(
        seq,
        ResponseCode::UnknownChannel,
        &format!("channel {} is not open", channel),
    )
}

impl fmt::Debug for ControlServer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ControlServer")
            .field("instance_id", &self.state.instance_id)
            .field("bindings", &self.bound_nodes().len())
            .field("channels", &self.open_channels())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ApplicationId;
    use crate::protocol::{decode_channel_id, decode_count};
    use slog::{o, Discard};

    fn server() -> (ControlServer, NodeId) {
        let instance = InstanceId::new_random();
        let node = NodeId::new(&instance, &ApplicationId::new_random());
        (ControlServer::new(instance, Logger::root(Discard, o!())), node)
    }

    fn echo() -> Arc<dyn RequestDispatcher> {
        Arc::new(|_: &NodeId, payload: &[u8]| -> Result<Vec<u8>, String> {
            Ok(payload.to_vec())
        })
    }

    fn request(seq: u64, command: Command) -> Response {
        let (server, _) = server();
        server
            .handle_request(&Request { seq, command }.encode())
            .unwrap()
    }

    #[test]
    fn duplicate_binding_rejected() {
        let (server, node) = server();
        server.bind(node.clone(), echo()).unwrap();
        assert!(matches!(
            server.bind(node.clone(), echo()),
            Err(Error::BindingExists(_))
        ));
        assert!(server.unbind(&node));
        assert!(!server.unbind(&node));
    }

    #[test]
    fn channel_lifecycle() {
        let (server, node) = server();
        server.bind(node.clone(), echo()).unwrap();

        let open = Request {
            seq: 1,
            command: Command::OpenChannel {
                node: node.clone(),
                origin: InstanceId::new_random(),
            },
        };
        let reply = server.handle_request(&open.encode()).unwrap();
        let channel = decode_channel_id(&reply.into_result().unwrap()).unwrap();

        let invoke = Request {
            seq: 2,
            command: Command::Invoke {
                channel,
                payload: b"hello".to_vec(),
            },
        };
        let reply = server.handle_request(&invoke.encode()).unwrap();
        assert_eq!(reply.seq, 2);
        assert_eq!(reply.into_result().unwrap(), b"hello");

        // Unbinding invalidates the channel.
        server.unbind(&node);
        let reply = server.handle_request(&invoke.encode()).unwrap();
        assert_eq!(reply.code, ResponseCode::UnknownChannel);
        assert_eq!(server.open_channels(), 0);
    }

    #[test]
    fn unknown_node_and_channel() {
        let (_, node) = server();
        assert_eq!(
            request(
                5,
                Command::OpenChannel {
                    node,
                    origin: InstanceId::new_random(),
                },
            )
            .code,
            ResponseCode::UnknownNode
        );
        assert_eq!(
            request(6, Command::CloseChannel(99)).code,
            ResponseCode::UnknownChannel
        );
    }

    #[test]
    fn unknown_op_and_garbage() {
        let (server, _) = server();
        let mut body = Vec::new();
        body.extend_from_slice(&7u64.to_be_bytes());
        body.push(77);
        let reply = server.handle_request(&body).unwrap();
        assert_eq!(reply.seq, 7);
        assert_eq!(reply.code, ResponseCode::UnknownCommand);

        body[8] = Op::OpenChannel as u8;
        body.extend_from_slice(&[0, 3, 1]);
        let reply = server.handle_request(&body).unwrap();
        assert_eq!(reply.code, ResponseCode::Malformed);

        assert!(server.handle_request(&[1, 2]).is_none());
    }

    #[test]
    fn dispatch_failure_reported() {
        let (server, node) = server();
        server
            .bind(
                node.clone(),
                Arc::new(|_: &NodeId, _: &[u8]| -> Result<Vec<u8>, String> {
                    Err(String::from("nope"))
                }),
            )
            .unwrap();
        let open = Request {
            seq: 1,
            command: Command::OpenChannel {
                node,
                origin: InstanceId::new_random(),
            },
        };
        let channel = decode_channel_id(
            &server
                .handle_request(&open.encode())
                .unwrap()
                .into_result()
                .unwrap(),
        )
        .unwrap();
        let invoke = Request {
            seq: 2,
            command: Command::Invoke {
                channel,
                payload: Vec::new(),
            },
        };
        let reply = server.handle_request(&invoke.encode()).unwrap();
        assert_eq!(reply.code, ResponseCode::DispatchFailed);
        assert_eq!(reply.payload, b"nope");
    }

    fn open(
        server: &ControlServer,
        seq: u64,
        node: &NodeId,
        origin: &InstanceId,
    ) -> ChannelId {
        let request = Request {
            seq,
            command: Command::OpenChannel {
                node: node.clone(),
                origin: origin.clone(),
            },
        };
        let reply = server.handle_request(&request.encode()).unwrap();
        decode_channel_id(&reply.into_result().unwrap()).unwrap()
    }

    #[test]
    fn routes_are_reported_and_closed_per_origin() {
        let (server, node) = server();
        server.bind(node.clone(), echo()).unwrap();
        let near = InstanceId::new_random();
        let far = InstanceId::new_random();
        let a = open(&server, 1, &node, &near);
        let b = open(&server, 2, &node, &near);
        let c = open(&server, 3, &node, &far);

        let request = Request {
            seq: 4,
            command: Command::GetRoutingStatus,
        };
        let reply = server.handle_request(&request.encode()).unwrap();
        let routing = RoutingStatus::decode(&reply.into_result().unwrap()).unwrap();
        assert_eq!(&routing.instance_id, server.instance_id());
        assert_eq!(routing.routes.len(), 3);
        assert_eq!(
            routing.channels_by_node()[&node],
            vec![a, b, c].into_iter().collect::<BTreeSet<_>>()
        );
        assert_eq!(
            routing.channels_from(&near),
            vec![a, b].into_iter().collect::<BTreeSet<_>>()
        );

        let request = Request {
            seq: 5,
            command: Command::CloseChannelsFrom(near.clone()),
        };
        let reply = server.handle_request(&request.encode()).unwrap();
        assert_eq!(reply.seq, 5);
        assert_eq!(decode_count(&reply.into_result().unwrap()).unwrap(), 2);
        assert_eq!(server.open_channels(), 1);
        assert_eq!(
            server.routing_status().routes.keys().cloned().collect::<Vec<_>>(),
            vec![c]
        );

        // Nothing left for that origin.
        assert_eq!(server.close_channels_from(&near), 0);
    }

    #[test]
    fn status_lists_bound_nodes() {
        let (server, node) = server();
        server.bind(node.clone(), echo()).unwrap();
        let status = server.status();
        assert_eq!(&status.instance_id, server.instance_id());
        assert!(status.nodes.contains(&node));
        assert_eq!(status.nodes.len(), 1);
    }
}
