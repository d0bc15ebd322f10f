#![no_main]

use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use tether_router::{
    DisconnectReason, EndpointClient, InterfaceIdNamespace, Message, MessagePipe, Router,
    RouterConfig, TaskRunner,
};

mod utils;

const TIMEOUT: Duration = Duration::from_secs(1);

struct AcceptAll;

impl EndpointClient for AcceptAll {
    fn handle_incoming_message(&self, _message: &Message) -> bool {
        true
    }

    fn notify_error(&self, _reason: Option<DisconnectReason>) {}
}

/// Feeds every frame to a router through its pipe and checks that a router which gave up has
/// closed the pipe.
async fn run_frames(frames: Vec<Vec<u8>>) {
    let runner = TaskRunner::new();
    let (raw, routed) = MessagePipe::new(&runner).into_handles();
    let router = Router::new(routed, InterfaceIdNamespace::Service, RouterConfig::default());
    let master = router
        .create_local_endpoint_handle(0)
        .expect("master endpoint");
    router.attach_endpoint_client(&master, Rc::new(AcceptAll));

    for frame in frames {
        if raw.write(Message::from_bytes(frame)).is_err() {
            break;
        }
        runner.run_until_idle().await;
    }

    if router.encountered_error() {
        assert!(raw.is_peer_closed());
    }
    router.detach_endpoint_client(&master);
    drop(master);
    router.close();
    runner.run_until_idle().await;
}

struct Runner {
    input_tx: mpsc::SyncSender<Vec<Vec<u8>>>,
    output_rx: Mutex<mpsc::Receiver<()>>,
}

fn runner() -> &'static Runner {
    static RUNNER: OnceLock<Runner> = OnceLock::new();
    RUNNER.get_or_init(|| {
        let (input_tx, input_rx) = mpsc::sync_channel::<Vec<Vec<u8>>>(0);
        let (output_tx, output_rx) = mpsc::sync_channel::<()>(0);

        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("failed to build fuzz_router_accept runtime");
            for frames in input_rx {
                rt.block_on(run_frames(frames));
                let _ = output_tx.send(());
            }
        });

        Runner {
            input_tx,
            output_rx: Mutex::new(output_rx),
        }
    })
}

fuzz_target!(|data: &[u8]| {
    let runner = runner();
    runner
        .input_tx
        .send(utils::split_frames(data))
        .expect("fuzz_router_accept worker thread exited");

    match runner
        .output_rx
        .lock()
        .expect("fuzz_router_accept worker receiver poisoned")
        .recv_timeout(TIMEOUT)
    {
        Ok(()) => {}
        Err(mpsc::RecvTimeoutError::Timeout) => panic!("fuzz_router_accept fuzz target timed out"),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            panic!("fuzz_router_accept worker thread panicked")
        }
    }
});
