use std::cell::RefCell;
use std::rc::Rc;

use tether_proto::control::peer_endpoint_closed_message;
use tether_proto::{ValidationError, MASTER_INTERFACE_ID};
use tether_router::{Message, RouterConfig, TaskRunner};

use super::support::{attach, event_log, message_for, router_with_raw_peer};

fn record_validation_errors(router: &tether_router::Router) -> Rc<RefCell<Vec<ValidationError>>> {
    let errors = Rc::new(RefCell::new(Vec::new()));
    let sink = errors.clone();
    router.set_validation_error_handler(move |error| sink.borrow_mut().push(error.clone()));
    errors
}

#[tokio::test]
async fn malformed_header_closes_the_pipe() {
    let runner = TaskRunner::new();
    let (router, raw) = router_with_raw_peer(&runner, RouterConfig::default());
    let errors = record_validation_errors(&router);

    raw.write(Message::from_bytes(vec![1, 2, 3])).unwrap();
    runner.run_until_idle().await;

    assert!(router.is_closed());
    assert!(router.encountered_error());
    assert!(raw.is_peer_closed());
    assert_eq!(
        *errors.borrow(),
        vec![ValidationError::MessageTooShort { len: 3 }]
    );
    assert!(!router.send_message(message_for(MASTER_INTERFACE_ID, 1)));
}

#[tokio::test]
async fn testing_mode_reports_but_keeps_the_pipe_open() {
    let runner = TaskRunner::new();
    let (router, raw) = router_with_raw_peer(&runner, RouterConfig::for_testing());
    let errors = record_validation_errors(&router);

    raw.write(Message::from_bytes(vec![0xFF; 40])).unwrap();
    raw.write(Message::from_bytes(vec![])).unwrap();
    runner.run_until_idle().await;

    assert!(!router.is_closed());
    assert_eq!(errors.borrow().len(), 2);
    assert!(!raw.is_peer_closed());
}

#[tokio::test]
async fn enable_testing_mode_takes_effect_immediately() {
    let runner = TaskRunner::new();
    let (router, raw) = router_with_raw_peer(&runner, RouterConfig::default());
    assert!(!router.is_testing_mode());
    router.enable_testing_mode();

    raw.write(Message::from_bytes(vec![0; 8])).unwrap();
    runner.run_until_idle().await;
    assert!(!router.is_closed());
}

#[tokio::test]
async fn oversized_messages_are_rejected() {
    let runner = TaskRunner::new();
    let config = RouterConfig {
        max_message_len: 32,
        ..RouterConfig::default()
    };
    let (router, raw) = router_with_raw_peer(&runner, config);
    let errors = record_validation_errors(&router);

    let big = Message::new(tether_proto::MessageHeader::new(1), &[0; 64]);
    raw.write(big).unwrap();
    runner.run_until_idle().await;

    assert!(router.is_closed());
    assert!(matches!(
        errors.borrow()[0],
        ValidationError::MessageTooLarge { len: 88, max: 32 }
    ));
}

#[tokio::test]
async fn reasonless_master_close_from_the_peer_is_a_protocol_error() {
    let runner = TaskRunner::new();
    let (router, raw) = router_with_raw_peer(&runner, RouterConfig::default());
    let _master = router.create_local_endpoint_handle(MASTER_INTERFACE_ID).unwrap();

    raw.write(peer_endpoint_closed_message(MASTER_INTERFACE_ID, None))
        .unwrap();
    runner.run_until_idle().await;
    assert!(router.is_closed());
}

#[tokio::test]
async fn client_rejection_closes_the_pipe() {
    let runner = TaskRunner::new();
    let (router, raw) = router_with_raw_peer(&runner, RouterConfig::default());
    let log = event_log();
    let master = router.create_local_endpoint_handle(MASTER_INTERFACE_ID).unwrap();
    let client = attach(&router, &master, &log);
    client.accept.set(false);

    raw.write(message_for(MASTER_INTERFACE_ID, 5)).unwrap();
    raw.write(message_for(MASTER_INTERFACE_ID, 6)).unwrap();
    runner.run_until_idle().await;

    assert!(router.is_closed());
    // The second message never reaches the client; the pipe was closed under it.
    let messages = log
        .borrow()
        .iter()
        .filter(|event| matches!(event, super::support::Event::Message { .. }))
        .count();
    assert_eq!(messages, 1);
}

#[tokio::test]
async fn wait_for_next_message_dispatches_synchronously() {
    let runner = TaskRunner::new();
    let (router, raw) = router_with_raw_peer(&runner, RouterConfig::default());
    let log = event_log();
    let master = router.create_local_endpoint_handle(MASTER_INTERFACE_ID).unwrap();
    let _client = attach(&router, &master, &log);

    raw.write(message_for(MASTER_INTERFACE_ID, 3)).unwrap();
    assert!(router.wait_for_next_message_for_testing());
    assert_eq!(log.borrow().len(), 1);
    assert!(!router.wait_for_next_message_for_testing());
}

#[tokio::test]
async fn peer_close_for_an_unallocated_own_id_is_rejected() {
    let runner = TaskRunner::new();
    let (router, raw) = router_with_raw_peer(&runner, RouterConfig::default());
    let errors = record_validation_errors(&router);

    // Ids without the namespace bit belong to this service-side router.
    raw.write(peer_endpoint_closed_message(5, None)).unwrap();
    runner.run_until_idle().await;

    assert!(router.is_closed());
    assert_eq!(router.endpoint_state(5), None);
    assert_eq!(
        *errors.borrow(),
        vec![ValidationError::UnexpectedInterfaceId { id: 5 }]
    );
}

#[tokio::test]
async fn unallocated_own_ids_do_not_grow_the_table_in_testing_mode() {
    let runner = TaskRunner::new();
    let (router, raw) = router_with_raw_peer(&runner, RouterConfig::for_testing());
    let errors = record_validation_errors(&router);

    for id in 1..=64 {
        raw.write(peer_endpoint_closed_message(id, None)).unwrap();
    }
    runner.run_until_idle().await;

    assert!(!router.is_closed());
    assert_eq!(router.endpoint_count(), 0);
    assert_eq!(errors.borrow().len(), 64);
}

#[tokio::test]
async fn peer_close_for_an_allocated_own_id_is_accepted() {
    let runner = TaskRunner::new();
    let (router, raw) = router_with_raw_peer(&runner, RouterConfig::default());
    let errors = record_validation_errors(&router);
    let handle = router.create_associated_endpoint_handle().unwrap();
    let id = handle.id();

    raw.write(peer_endpoint_closed_message(id, None)).unwrap();
    runner.run_until_idle().await;

    assert!(!router.is_closed());
    assert!(errors.borrow().is_empty());
    assert!(router.endpoint_state(id).unwrap().peer_closed);
}
