use std::cell::RefCell;
use std::rc::Rc;

use tether_bindings::{
    make_request, BindingId, BindingSet, DisconnectReason, InterfacePtrController, TaskRunner,
};

use crate::suite::support::{EchoInterface, RecordingEcho};

type Errors = Rc<RefCell<Vec<(BindingId, Option<DisconnectReason>)>>>;

fn set_with_log() -> (BindingSet<EchoInterface>, Errors) {
    let set = BindingSet::<EchoInterface>::new();
    let errors: Errors = Rc::new(RefCell::new(Vec::new()));
    set.set_connection_error_handler({
        let errors = errors.clone();
        move |id, reason| errors.borrow_mut().push((id, reason))
    });
    (set, errors)
}

fn connect(
    set: &BindingSet<EchoInterface>,
    implementation: &Rc<RecordingEcho>,
    runner: &TaskRunner,
) -> (BindingId, InterfacePtrController<EchoInterface>) {
    let mut ptr = InterfacePtrController::new();
    let request = make_request(&mut ptr, runner);
    let id = set.add_binding(implementation.clone(), request);
    (id, ptr)
}

#[tokio::test]
async fn one_failing_connection_leaves_the_others_serving() {
    let runner = TaskRunner::new();
    let implementation = RecordingEcho::new();
    let (set, errors) = set_with_log();
    let (first, mut first_ptr) = connect(&set, &implementation, &runner);
    let (second, mut second_ptr) = connect(&set, &implementation, &runner);
    let (third, mut third_ptr) = connect(&set, &implementation, &runner);
    assert_eq!(set.len(), 3);

    second_ptr.reset_with_reason(5, "second is leaving");
    runner.run_until_idle().await;

    assert_eq!(
        *errors.borrow(),
        [(second, Some(DisconnectReason::new(5, "second is leaving")))]
    );
    assert_eq!(set.ids(), [first, third]);
    assert!(!set.contains(second));

    let one = first_ptr.proxy().unwrap().echo("one");
    let three = third_ptr.proxy().unwrap().echo("three");
    runner.run_until_idle().await;
    assert_eq!(one.await.unwrap(), "one");
    assert_eq!(three.await.unwrap(), "three");
    assert_eq!(implementation.echoes(), ["one", "three"]);
    assert_eq!(errors.borrow().len(), 1);
}

#[tokio::test]
async fn binding_ids_are_not_reused() {
    let runner = TaskRunner::new();
    let implementation = RecordingEcho::new();
    let (set, errors) = set_with_log();
    let (first, mut first_ptr) = connect(&set, &implementation, &runner);

    first_ptr.reset();
    runner.run_until_idle().await;
    assert!(set.is_empty());

    let (second, _second_ptr) = connect(&set, &implementation, &runner);
    assert_ne!(first, second);
    assert_eq!(*errors.borrow(), [(first, None)]);
}

#[tokio::test]
async fn removed_and_closed_bindings_do_not_report_errors() {
    let runner = TaskRunner::new();
    let implementation = RecordingEcho::new();
    let (set, errors) = set_with_log();
    let (first, _first_ptr) = connect(&set, &implementation, &runner);
    let (_second, mut second_ptr) = connect(&set, &implementation, &runner);
    let (_third, mut third_ptr) = connect(&set, &implementation, &runner);

    assert!(set.remove_binding(first));
    assert!(!set.remove_binding(first));
    set.close_all_bindings();
    runner.run_until_idle().await;

    assert!(set.is_empty());
    assert!(errors.borrow().is_empty());
    assert!(second_ptr.proxy().is_some());
    runner.run_until_idle().await;
    assert!(second_ptr.encountered_error());
    assert!(third_ptr.proxy().is_some());
    runner.run_until_idle().await;
    assert!(third_ptr.encountered_error());
}

#[tokio::test]
async fn dropping_the_set_closes_every_pipe() {
    let runner = TaskRunner::new();
    let implementation = RecordingEcho::new();
    let (set, _errors) = set_with_log();
    let (_id, mut ptr) = connect(&set, &implementation, &runner);
    assert!(ptr.proxy().is_some());

    drop(set);
    runner.run_until_idle().await;

    assert!(ptr.encountered_error());
}
