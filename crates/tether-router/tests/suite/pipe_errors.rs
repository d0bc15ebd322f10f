use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tether_proto::{DisconnectReason, INTERFACE_ID_NAMESPACE_MASK, MASTER_INTERFACE_ID};
use tether_router::{
    Connector, ConnectorErrorHandler, IncomingReceiver, InterfaceIdNamespace, Message, PipeHandle,
    Router, RouterConfig, TaskRunner,
};

use super::support::{attach, event_log, message_for, router_pair, Event};

#[tokio::test]
async fn pipe_error_notifies_every_attached_client_once() {
    let runner = TaskRunner::new();
    let (client_side, service_side) = router_pair(&runner);
    let log = event_log();

    let ids = [1u32, 2, 3].map(|n| INTERFACE_ID_NAMESPACE_MASK | n);
    let handles: Vec<_> = ids
        .iter()
        .map(|id| service_side.create_local_endpoint_handle(*id).unwrap())
        .collect();
    let clients: Vec<_> = handles
        .iter()
        .map(|handle| attach(&service_side, handle, &log))
        .collect();

    let reason = DisconnectReason::new(9, "first endpoint went away");
    assert!(service_side.on_peer_associated_endpoint_closed(ids[0], Some(reason.clone())));
    runner.run_until_idle().await;
    log.borrow_mut().clear();

    drop(client_side);
    runner.run_until_idle().await;

    assert!(service_side.encountered_error());
    let errors = log.borrow().clone();
    assert_eq!(
        errors,
        vec![
            Event::Error {
                endpoint: ids[0],
                reason: Some(reason)
            },
            Event::Error {
                endpoint: ids[1],
                reason: None
            },
            Event::Error {
                endpoint: ids[2],
                reason: None
            },
        ]
    );
    for id in ids {
        assert!(service_side.endpoint_state(id).unwrap().peer_closed);
    }

    for handle in handles {
        service_side.detach_endpoint_client(&handle);
        handle.close();
    }
    drop(clients);
    assert_eq!(service_side.endpoint_count(), 0);
}

#[tokio::test]
async fn endpoints_created_after_an_error_are_already_peer_closed() {
    let runner = TaskRunner::new();
    let (client_side, service_side) = router_pair(&runner);
    let log = event_log();
    client_side.close();
    runner.run_until_idle().await;
    assert!(service_side.encountered_error());

    let handle = service_side
        .create_local_endpoint_handle(MASTER_INTERFACE_ID)
        .unwrap();
    assert!(service_side.endpoint_state(MASTER_INTERFACE_ID).unwrap().peer_closed);
    let _client = attach(&service_side, &handle, &log);
    runner.run_until_idle().await;
    assert_eq!(
        *log.borrow(),
        vec![Event::Error {
            endpoint: MASTER_INTERFACE_ID,
            reason: None
        }]
    );
}

#[tokio::test]
async fn close_is_idempotent_and_stops_sends() {
    let runner = TaskRunner::new();
    let (client_side, service_side) = router_pair(&runner);
    let log = event_log();
    let handle = client_side
        .create_local_endpoint_handle(MASTER_INTERFACE_ID)
        .unwrap();
    let _client = attach(&client_side, &handle, &log);

    client_side.close();
    client_side.close();
    runner.run_until_idle().await;

    assert_eq!(log.borrow().len(), 1);
    assert!(!client_side.send_message(message_for(MASTER_INTERFACE_ID, 1)));
    assert!(service_side.encountered_error());
}

#[tokio::test]
async fn passing_the_pipe_keeps_it_open() {
    let runner = TaskRunner::new();
    let (client_side, service_side) = router_pair(&runner);

    let handle = client_side.pass_message_pipe().expect("pipe");
    client_side.close();
    runner.run_until_idle().await;
    assert!(!service_side.encountered_error());

    let adopted = Router::new(handle, InterfaceIdNamespace::Client, RouterConfig::default());
    assert!(adopted.send_message(message_for(MASTER_INTERFACE_ID, 1)));
    drop(adopted);
    runner.run_until_idle().await;
    assert!(service_side.encountered_error());
}

#[derive(Default)]
struct FakeConnectorState {
    sent: RefCell<Vec<Message>>,
    receiver: RefCell<Option<IncomingReceiver>>,
    error_handler: RefCell<Option<ConnectorErrorHandler>>,
    closed: Cell<bool>,
}

struct FakeConnector(Rc<FakeConnectorState>);

impl Connector for FakeConnector {
    fn set_incoming_receiver(&self, receiver: IncomingReceiver) {
        *self.0.receiver.borrow_mut() = Some(receiver);
    }

    fn set_error_handler(&self, handler: ConnectorErrorHandler) {
        *self.0.error_handler.borrow_mut() = Some(handler);
    }

    fn accept(&self, message: Message) -> bool {
        if self.0.closed.get() {
            return false;
        }
        self.0.sent.borrow_mut().push(message);
        true
    }

    fn close(&self) {
        self.0.closed.set(true);
    }

    fn pass_handle(&self) -> Option<PipeHandle> {
        None
    }

    fn encountered_error(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn router_works_over_any_connector() {
    let runner = TaskRunner::new();
    let state = Rc::new(FakeConnectorState::default());
    let router = Router::with_connector(
        Box::new(FakeConnector(state.clone())),
        runner.clone(),
        InterfaceIdNamespace::Client,
        RouterConfig::default(),
    );
    let log = event_log();
    let master = router
        .create_local_endpoint_handle(MASTER_INTERFACE_ID)
        .unwrap();
    let _client = attach(&router, &master, &log);

    let receiver = state.receiver.borrow().clone().expect("receiver installed");
    assert!(receiver(message_for(MASTER_INTERFACE_ID, 4)));
    assert_eq!(
        *log.borrow(),
        vec![Event::Message {
            endpoint: MASTER_INTERFACE_ID,
            name: 4
        }]
    );

    let associated = router.create_associated_endpoint_handle().unwrap();
    associated.close();
    assert_eq!(state.sent.borrow().len(), 1);

    let on_error = state.error_handler.borrow().clone().expect("error handler installed");
    on_error();
    runner.run_until_idle().await;
    assert!(router.encountered_error());
    assert_eq!(log.borrow().len(), 2);
}
