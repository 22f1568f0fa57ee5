//! Software timer scenarios.
mod common;

use std::sync::Mutex;

use common::init_logger;
use keel_kernel::{Kernel, TimerMode};
use keel_port_std::{SimKernel, StdPort};

struct FireLog {
    kernel: &'static Kernel<StdPort>,
    fired_at: Mutex<Vec<u32>>,
}

/// Timer callback: records the kernel time of each expiry. Taking the
/// kernel lock here only works because handlers run with no critical
/// section held.
fn record_fire(param: usize) {
    // Safety: `param` is a leaked `&'static FireLog` from the test body.
    let log = unsafe { &*(param as *const FireLog) };
    log.fired_at.lock().unwrap().push(log.kernel.time());
}

fn fire_log(kernel: &'static Kernel<StdPort>) -> &'static FireLog {
    Box::leak(Box::new(FireLog {
        kernel,
        fired_at: Mutex::new(Vec::new()),
    }))
}

/// An auto-reload timer with interval 10 started at tick 0 fires at
/// 10, 20, 30 — re-armed from its previous expiry, so there is no drift.
#[test]
fn auto_reload_fires_on_schedule() {
    init_logger();
    let sim = SimKernel::new(64 * 1024);
    let k = sim.kernel();
    let log = fire_log(k);

    let t = k
        .timer_create(TimerMode::AutoReload, 10, record_fire, log as *const FireLog as usize)
        .unwrap();
    k.timer_start(t).unwrap();

    sim.start();
    sim.advance(35);
    assert_eq!(*log.fired_at.lock().unwrap(), vec![10, 20, 30]);

    k.timer_stop(t).unwrap();
    assert_eq!(k.timer_is_running(t), Ok(false));
    sim.advance(20);
    assert_eq!(log.fired_at.lock().unwrap().len(), 3);
}

/// A one-shot timer fires once and parks; restarting arms it for one more
/// interval from now.
#[test]
fn one_shot_fires_once() {
    init_logger();
    let sim = SimKernel::new(64 * 1024);
    let k = sim.kernel();
    let log = fire_log(k);

    let t = k
        .timer_create(TimerMode::OneShot, 7, record_fire, log as *const FireLog as usize)
        .unwrap();
    k.timer_start(t).unwrap();

    sim.start();
    sim.advance(20);
    assert_eq!(*log.fired_at.lock().unwrap(), vec![7]);
    assert_eq!(k.timer_is_running(t), Ok(false));

    k.timer_start(t).unwrap();
    sim.advance(10);
    assert_eq!(*log.fired_at.lock().unwrap(), vec![7, 27]);
}

/// Resetting changes the interval while preserving the running state.
#[test]
fn reset_preserves_running_state() {
    init_logger();
    let sim = SimKernel::new(64 * 1024);
    let k = sim.kernel();
    let log = fire_log(k);

    let t = k
        .timer_create(TimerMode::AutoReload, 10, record_fire, log as *const FireLog as usize)
        .unwrap();
    k.timer_start(t).unwrap();

    sim.start();
    sim.advance(5);
    // Re-arm with a 3-tick interval; next expiries land at 8, 11, 14.
    k.timer_reset(t, 3).unwrap();
    sim.advance(10);
    assert_eq!(*log.fired_at.lock().unwrap(), vec![8, 11, 14]);

    // Resetting a stopped timer leaves it stopped.
    let idle_timer = k
        .timer_create(TimerMode::OneShot, 5, record_fire, log as *const FireLog as usize)
        .unwrap();
    k.timer_reset(idle_timer, 9).unwrap();
    assert_eq!(k.timer_is_running(idle_timer), Ok(false));

    k.timer_delete(t).unwrap();
    assert_eq!(k.timer_is_running(t), Err(keel_kernel::Error::InvalidHandle));
}
