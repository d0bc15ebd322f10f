use tether_proto::control::{decode_pipe_control, PipeControlInput};
use tether_proto::{INTERFACE_ID_NAMESPACE_MASK, INVALID_INTERFACE_ID, MASTER_INTERFACE_ID};
use tether_router::{DisconnectReason, RouterConfig, TaskRunner};

use super::support::{attach, drain, event_log, message_for, router_pair, router_with_raw_peer, Event};

#[tokio::test]
async fn create_local_endpoint_handle_refuses_bad_and_duplicate_ids() {
    let runner = TaskRunner::new();
    let (client_side, service_side) = router_pair(&runner);

    assert!(service_side.create_local_endpoint_handle(INVALID_INTERFACE_ID).is_none());
    // Ids without the namespace bit belong to the service side itself.
    assert!(service_side.create_local_endpoint_handle(5).is_none());
    assert!(client_side
        .create_local_endpoint_handle(INTERFACE_ID_NAMESPACE_MASK | 5)
        .is_none());

    let master = service_side
        .create_local_endpoint_handle(MASTER_INTERFACE_ID)
        .expect("master handle");
    assert!(master.is_master());
    assert!(service_side
        .create_local_endpoint_handle(MASTER_INTERFACE_ID)
        .is_none());

    let remote = service_side
        .create_local_endpoint_handle(INTERFACE_ID_NAMESPACE_MASK | 5)
        .expect("remote handle");
    assert!(service_side
        .create_local_endpoint_handle(remote.id())
        .is_none());
    let state = service_side.endpoint_state(remote.id()).unwrap();
    assert!(state.handle_created && !state.closed && !state.peer_closed);
}

#[tokio::test]
async fn messages_on_different_endpoints_keep_send_order() {
    let runner = TaskRunner::new();
    let (client_side, service_side) = router_pair(&runner);
    let log = event_log();

    let a = client_side.create_associated_endpoint_handle().unwrap();
    let b = client_side.create_associated_endpoint_handle().unwrap();
    assert_ne!(a.id(), b.id());
    let peer_a = service_side.create_local_endpoint_handle(a.id()).unwrap();
    let peer_b = service_side.create_local_endpoint_handle(b.id()).unwrap();
    let _client_a = attach(&service_side, &peer_a, &log);
    let _client_b = attach(&service_side, &peer_b, &log);

    for name in 0..6 {
        let id = if name % 2 == 0 { a.id() } else { b.id() };
        assert!(client_side.send_message(message_for(id, name)));
    }
    runner.run_until_idle().await;

    let expected: Vec<Event> = (0..6)
        .map(|name| Event::Message {
            endpoint: if name % 2 == 0 { a.id() } else { b.id() },
            name,
        })
        .collect();
    assert_eq!(*log.borrow(), expected);
}

#[tokio::test]
async fn closing_an_endpoint_notifies_the_peer_and_frees_both_records() {
    let runner = TaskRunner::new();
    let (client_side, service_side) = router_pair(&runner);
    let log = event_log();

    let local = client_side.create_associated_endpoint_handle().unwrap();
    let id = local.id();
    let remote = service_side.create_local_endpoint_handle(id).unwrap();
    let _client = attach(&service_side, &remote, &log);

    let reason = DisconnectReason::new(7, "done");
    local.close_with_reason(reason.clone());
    assert!(client_side.endpoint_state(id).unwrap().closed);

    runner.run_until_idle().await;
    assert_eq!(
        *log.borrow(),
        vec![Event::Error {
            endpoint: id,
            reason: Some(reason.clone())
        }]
    );
    let state = service_side.endpoint_state(id).unwrap();
    assert!(state.peer_closed);
    assert_eq!(state.disconnect_reason, Some(reason));

    service_side.detach_endpoint_client(&remote);
    drop(remote);
    assert!(service_side.endpoint_state(id).is_none());

    runner.run_until_idle().await;
    assert!(client_side.endpoint_state(id).is_none());
}

#[tokio::test]
async fn peer_close_before_adoption_is_reported_after_attach() {
    let runner = TaskRunner::new();
    let (client_side, service_side) = router_pair(&runner);
    let log = event_log();

    let local = client_side.create_associated_endpoint_handle().unwrap();
    let id = local.id();
    local.close_with_reason(DisconnectReason::new(1, "early"));
    runner.run_until_idle().await;

    let state = service_side.endpoint_state(id).expect("record created by the notification");
    assert!(state.peer_closed && !state.handle_created);

    let handle = service_side.create_local_endpoint_handle(id).unwrap();
    let _client = attach(&service_side, &handle, &log);
    assert!(log.borrow().is_empty(), "notification must be deferred");

    runner.run_until_idle().await;
    assert_eq!(
        *log.borrow(),
        vec![Event::Error {
            endpoint: id,
            reason: Some(DisconnectReason::new(1, "early"))
        }]
    );
}

#[tokio::test]
async fn removed_records_stay_removed() {
    let runner = TaskRunner::new();
    let (_client_side, service_side) = router_pair(&runner);
    let id = INTERFACE_ID_NAMESPACE_MASK | 3;

    let handle = service_side.create_local_endpoint_handle(id).unwrap();
    assert!(service_side.on_peer_associated_endpoint_closed(id, None));
    handle.close();
    assert!(service_side.endpoint_state(id).is_none());

    assert!(service_side.on_peer_associated_endpoint_closed(id, None));
    assert!(service_side
        .on_peer_associated_endpoint_closed(id, Some(DisconnectReason::new(2, "again"))));
    assert!(service_side.endpoint_state(id).is_none());
    assert!(service_side.create_local_endpoint_handle(id).is_none());
}

#[tokio::test]
async fn master_close_sends_a_notification_only_with_a_reason() {
    let runner = TaskRunner::new();
    let (router, raw) = router_with_raw_peer(&runner, RouterConfig::default());

    router
        .create_local_endpoint_handle(MASTER_INTERFACE_ID)
        .unwrap()
        .close();
    assert!(drain(&raw).is_empty());

    let (router, raw) = router_with_raw_peer(&runner, RouterConfig::default());
    let reason = DisconnectReason::new(4, "shutting down");
    router
        .create_local_endpoint_handle(MASTER_INTERFACE_ID)
        .unwrap()
        .close_with_reason(reason.clone());
    let sent = drain(&raw);
    assert_eq!(sent.len(), 1);
    assert_eq!(
        decode_pipe_control(&sent[0]).unwrap(),
        PipeControlInput::PeerAssociatedEndpointClosed {
            id: MASTER_INTERFACE_ID,
            reason: Some(reason)
        }
    );
    drop(router);
}

#[tokio::test]
async fn stale_messages_for_closed_or_unknown_endpoints_are_dropped() {
    let runner = TaskRunner::new();
    let (router, raw) = router_with_raw_peer(&runner, RouterConfig::default());
    let id = INTERFACE_ID_NAMESPACE_MASK | 9;
    let handle = router.create_local_endpoint_handle(id).unwrap();
    handle.close();

    raw.write(message_for(id, 1)).unwrap();
    raw.write(message_for(INTERFACE_ID_NAMESPACE_MASK | 10, 1)).unwrap();
    runner.run_until_idle().await;
    assert!(!router.is_closed());
}

#[tokio::test]
#[should_panic(expected = "already has a client")]
async fn attaching_twice_panics() {
    let runner = TaskRunner::new();
    let (_client_side, service_side) = router_pair(&runner);
    let log = event_log();
    let handle = service_side
        .create_local_endpoint_handle(MASTER_INTERFACE_ID)
        .unwrap();
    let _first = attach(&service_side, &handle, &log);
    let _second = attach(&service_side, &handle, &log);
}

#[tokio::test]
#[should_panic(expected = "while a client is attached")]
async fn closing_with_an_attached_client_panics() {
    let runner = TaskRunner::new();
    let (_client_side, service_side) = router_pair(&runner);
    let log = event_log();
    let handle = service_side
        .create_local_endpoint_handle(MASTER_INTERFACE_ID)
        .unwrap();
    let _client = attach(&service_side, &handle, &log);
    service_side.close_endpoint_handle(handle.id(), None);
}
