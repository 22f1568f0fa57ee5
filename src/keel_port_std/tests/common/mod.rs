//! Shared plumbing for the kernel scenario tests.
#![allow(dead_code)] // not every test binary uses every helper

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `cond` until it holds, panicking after a generous wall-clock budget.
/// Used to observe state written by simulated tasks, which run on their own
/// threads.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Wait for a task to deposit a value into `slot` and take it.
pub fn wait_for_value<T: Clone>(what: &str, slot: &Mutex<Option<T>>) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(v) = slot.lock().unwrap().clone() {
            return v;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
