// Shared by every integration test binary; not all of them use every
// helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use weft_kernel::{Director, Process, RendezvousError};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Run a registered process body on its own thread, retiring the
/// registration when the body returns.
///
/// Register every process of a scenario before starting any of them:
/// the deadlock monitor compares blocked against active counts, and a
/// half-registered model can trip it early.
pub fn run_process<F>(
    director: &Arc<Director>,
    process: Process,
    body: F,
) -> JoinHandle<Result<(), RendezvousError>>
where
    F: FnOnce(&Process) -> Result<(), RendezvousError> + Send + 'static,
{
    let director = director.clone();
    std::thread::spawn(move || {
        let result = body(&process);
        director.process_stopped(process);
        result
    })
}

/// Poll until the condition holds, with a hard timeout so a broken
/// protocol fails the test instead of hanging it.
pub fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            Instant::now() < deadline,
            "condition not reached within 5s"
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}
