// Copyright 2020 Joyent, Inc.

mod common;

use std::collections::BTreeSet;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;

use breakshot::connection_pool::types::AsyncConnectionPoolOptions;
use breakshot::connection_pool::AsyncConnectionPool;
use breakshot::control_client::{ControlClient, ControlClientOptions};
use breakshot::discovery::InstanceHostInfo;
use breakshot::error::Error;
use breakshot::id::{ApplicationId, InstanceId, NodeId};
use breakshot::instance::types::InstanceConnectionServiceOptions;
use breakshot::instance::InstanceConnectionService;
use breakshot::thread_context::ThreadContextPool;
use breakshot::transport::tcp_socket_factory;

use common::{start_contexts, test_log, wait_for, ListDiscovery, WAIT};

fn new_service(
    contexts: &Arc<ThreadContextPool>,
    discovery: &Arc<ListDiscovery>,
) -> InstanceConnectionService {
    InstanceConnectionService::new(
        InstanceConnectionServiceOptions {
            request_timeout: Some(2000),
            log: Some(test_log()),
            ..Default::default()
        },
        contexts.clone(),
        discovery.clone(),
    )
    .unwrap()
}

fn address(service: &InstanceConnectionService) -> String {
    service.local_address().unwrap().to_string()
}

fn echo_node(service: &InstanceConnectionService) -> NodeId {
    NodeId::new(service.instance_id(), &ApplicationId::new_random())
}

// A plain control client to `service`, outside of any instance service.
fn observer(
    contexts: &ThreadContextPool,
    service: &InstanceConnectionService,
) -> ControlClient {
    let pool = AsyncConnectionPool::new(
        AsyncConnectionPoolOptions {
            min_connections: Some(0),
            max_connections: Some(1),
            acquire_timeout: Some(2000),
            name: Some(String::from("observer")),
            log: Some(test_log()),
        },
        contexts,
        tcp_socket_factory(service.local_address().unwrap()),
    )
    .unwrap();
    ControlClient::new(
        pool,
        ControlClientOptions {
            log: Some(test_log()),
            ..Default::default()
        },
    )
}

fn echo(_: &NodeId, payload: &[u8]) -> Result<Vec<u8>, String> {
    Ok(payload.to_vec())
}

#[test]
#[serial]
fn start_and_stop_report_state_errors() {
    let contexts = Arc::new(start_contexts(1));
    let discovery = Arc::new(ListDiscovery::new());
    let service = new_service(&contexts, &discovery);

    assert!(matches!(service.stop(), Err(Error::NotRunning)));
    service.start().unwrap();
    assert!(matches!(service.start(), Err(Error::AlreadyRunning)));
    assert!(matches!(service.start(), Err(Error::AlreadyRunning)));
    assert!(service.local_address().is_some());

    service.stop().unwrap();
    assert!(matches!(service.stop(), Err(Error::NotRunning)));
    assert!(service.local_address().is_none());

    // A stopped service can be started again.
    service.start().unwrap();
    service.stop().unwrap();
    contexts.stop().unwrap();
}

#[test]
#[serial]
fn status_tracks_open_bindings() {
    let contexts = Arc::new(start_contexts(1));
    let discovery = Arc::new(ListDiscovery::new());
    let service = new_service(&contexts, &discovery);

    let a = echo_node(&service);
    let b = echo_node(&service);
    let mut binding_a = service.open_binding(a.clone(), echo).unwrap();
    let binding_b = service.open_binding(b.clone(), echo).unwrap();
    assert!(matches!(
        service.open_binding(a.clone(), echo),
        Err(Error::BindingExists(_))
    ));

    let status = service.get_instance_status();
    assert_eq!(&status.instance_id, service.instance_id());
    assert_eq!(status.nodes, vec![a.clone(), b.clone()].into_iter().collect::<BTreeSet<_>>());

    binding_a.close();
    assert!(!binding_a.is_open());
    assert_eq!(
        service.get_instance_status().nodes,
        vec![b].into_iter().collect::<BTreeSet<_>>()
    );
    drop(binding_b);
    assert!(service.get_instance_status().nodes.is_empty());

    // Nodes of other instances cannot be bound here.
    let foreign = NodeId::new(&InstanceId::new_random(), &ApplicationId::new_random());
    assert!(matches!(
        service.open_binding(foreign, echo),
        Err(Error::InvalidId(_))
    ));
    contexts.stop().unwrap();
}

#[test]
#[serial]
fn discovery_changes_open_and_close_pools() {
    let contexts = Arc::new(start_contexts(2));
    let peer_discovery = Arc::new(ListDiscovery::new());
    let peers: Vec<InstanceConnectionService> = (0..3)
        .map(|_| {
            let peer = new_service(&contexts, &peer_discovery);
            peer.start().unwrap();
            peer
        })
        .collect();

    let discovery = Arc::new(ListDiscovery::new());
    let service = new_service(&contexts, &discovery);
    let (connected_tx, connected_rx) = channel();
    let _on_connect = service.subscribe_to_connect(move |c| {
        connected_tx.send(c.instance_id().clone()).unwrap();
    });
    let (disconnected_tx, disconnected_rx) = channel();
    let _on_disconnect = service.subscribe_to_disconnect(move |c| {
        disconnected_tx.send(c.host().clone()).unwrap();
    });
    service.start().unwrap();

    for peer in &peers {
        discovery.add(&address(peer));
    }
    // Rediscovering a managed host changes nothing.
    discovery.add(&address(&peers[0]));

    assert!(wait_for(WAIT, || service.managed_hosts().len() == 3));
    service.refresh(WAIT).unwrap();
    assert_eq!(service.active_connections().len(), 3);
    let mut connected: Vec<InstanceId> = (0..3)
        .map(|_| connected_rx.recv_timeout(WAIT).unwrap())
        .collect();
    connected.sort();
    let mut expected: Vec<InstanceId> =
        peers.iter().map(|p| p.instance_id().clone()).collect();
    expected.sort();
    assert_eq!(connected, expected);

    let removed = address(&peers[1]);
    discovery.remove(&removed);
    assert!(wait_for(WAIT, || service.managed_hosts().len() == 2));
    assert!(!service
        .managed_hosts()
        .contains(&InstanceHostInfo::new(removed.as_str())));
    assert_eq!(
        disconnected_rx.recv_timeout(WAIT).unwrap(),
        InstanceHostInfo::new(removed.as_str())
    );
    assert!(connected_rx.try_recv().is_err());

    service.stop().unwrap();
    assert!(service.managed_hosts().is_empty());
    for peer in &peers {
        peer.stop().unwrap();
    }
    contexts.stop().unwrap();
}

#[test]
#[serial]
fn peers_read_each_others_status() {
    let contexts = Arc::new(start_contexts(2));
    let discovery_a = Arc::new(ListDiscovery::new());
    let discovery_b = Arc::new(ListDiscovery::new());
    let a = new_service(&contexts, &discovery_a);
    let b = new_service(&contexts, &discovery_b);
    a.start().unwrap();
    b.start().unwrap();

    let node_a = echo_node(&a);
    let node_b = echo_node(&b);
    let _binding_a = a.open_binding(node_a.clone(), echo).unwrap();
    let _binding_b = b
        .open_binding(
            node_b.clone(),
            |_: &NodeId, payload: &[u8]| -> Result<Vec<u8>, String> {
                Ok(payload.iter().map(|b| b.to_ascii_uppercase()).collect())
            },
        )
        .unwrap();

    discovery_a.add(&address(&b));
    discovery_b.add(&address(&a));
    a.refresh(WAIT).unwrap();
    b.refresh(WAIT).unwrap();

    let to_b = a.connection_for_node(&node_b).unwrap();
    let status = to_b.client().get_instance_status(None).unwrap();
    assert_eq!(&status.instance_id, b.instance_id());
    assert_eq!(status.nodes, vec![node_b.clone()].into_iter().collect::<BTreeSet<_>>());

    let to_a = b.connection_for_node(&node_a).unwrap();
    let status = to_a.client().get_instance_status(None).unwrap();
    assert_eq!(&status.instance_id, a.instance_id());
    assert_eq!(status.nodes, vec![node_a.clone()].into_iter().collect::<BTreeSet<_>>());

    let reply = to_b
        .invoke(&node_b, b"hello", Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(reply, b"HELLO".to_vec());

    a.stop().unwrap();
    b.stop().unwrap();
    contexts.stop().unwrap();
}

#[test]
#[serial]
fn own_address_is_ignored() {
    let contexts = Arc::new(start_contexts(1));
    let discovery = Arc::new(ListDiscovery::new());
    let service = new_service(&contexts, &discovery);
    service.start().unwrap();

    discovery.add(&address(&service));
    service.refresh(WAIT).unwrap();
    assert!(service.managed_hosts().is_empty());

    service.stop().unwrap();
    contexts.stop().unwrap();
}

#[test]
#[serial]
fn refresh_times_out_on_silent_hosts() {
    let contexts = Arc::new(start_contexts(1));
    let discovery = Arc::new(ListDiscovery::new());
    let service = new_service(&contexts, &discovery);
    service.start().unwrap();

    // Accepts connections but never answers a request.
    let silent = common::SinkServer::start();
    discovery.add(&silent.addr.to_string());
    let timeout = Duration::from_millis(300);
    match service.refresh(timeout) {
        Err(Error::Timeout { timeout: t, .. }) => assert_eq!(t, timeout),
        other => panic!("unexpected result {:?}", other),
    }
    assert!(service.active_connections().is_empty());

    // The status read fails after the request timeout and the host is
    // forgotten until the next refresh.
    assert!(wait_for(WAIT, || service.managed_hosts().is_empty()));

    service.stop().unwrap();
    contexts.stop().unwrap();
}

#[test]
fn secure_transport_is_not_available() {
    let contexts = Arc::new(start_contexts(1));
    let discovery = Arc::new(ListDiscovery::new());
    let result = InstanceConnectionService::new(
        InstanceConnectionServiceOptions {
            plaintext: Some(false),
            ..Default::default()
        },
        contexts.clone(),
        discovery,
    );
    assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    contexts.stop().unwrap();
}

#[test]
#[serial]
fn disconnected_hosts_return_on_refresh() {
    let contexts = Arc::new(start_contexts(2));
    let discovery_a = Arc::new(ListDiscovery::new());
    let a = new_service(&contexts, &discovery_a);
    let b = new_service(&contexts, &Arc::new(ListDiscovery::new()));
    a.start().unwrap();
    b.start().unwrap();
    let node_b = echo_node(&b);
    let _binding = b.open_binding(node_b.clone(), echo).unwrap();
    let (disconnected_tx, disconnected_rx) = channel();
    let _on_disconnect = a.subscribe_to_disconnect(move |c| {
        disconnected_tx.send(c.host().clone()).unwrap();
    });

    let host = InstanceHostInfo::new(address(&b).as_str());
    discovery_a.add(&address(&b));
    a.refresh(WAIT).unwrap();
    let to_b = a.connection_for_node(&node_b).unwrap();
    to_b.invoke(&node_b, b"one", None).unwrap();

    assert!(a.disconnect(&host));
    assert!(a.managed_hosts().is_empty());
    assert!(a.connection_for_node(&node_b).is_none());
    assert_eq!(disconnected_rx.recv_timeout(WAIT).unwrap(), host);
    assert!(!a.disconnect(&host));

    // Still discovered, so the next refresh connects again.
    a.refresh(WAIT).unwrap();
    assert_eq!(a.managed_hosts(), vec![host.clone()]);
    let to_b = a.connection_for_node(&node_b).unwrap();
    to_b.invoke(&node_b, b"two", None).unwrap();

    // An abrupt disconnect leaves its channel behind. Stopping closes
    // every channel opened on behalf of this instance.
    let observer = observer(&contexts, &b);
    let routing = observer.get_routing_status(None).unwrap();
    assert_eq!(routing.channels_from(a.instance_id()).len(), 2);
    a.stop().unwrap();
    let routing = observer.get_routing_status(None).unwrap();
    assert!(routing.channels_from(a.instance_id()).is_empty());

    observer.pool().close().unwrap();
    b.stop().unwrap();
    contexts.stop().unwrap();
}
