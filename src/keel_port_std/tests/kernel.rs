//! Scheduler and synchronization scenarios driven through the hosted port.
mod common;

use std::sync::{Arc, Mutex};

use common::{init_logger, wait_for_value, wait_until};
use keel_kernel::{Error, TaskState, WAIT_FOREVER};
use keel_port_std::SimKernel;

/// A semaphore released at tick 40 wakes a waiter that asked for up to 100
/// ticks; the waiter resumes at tick 40 with success.
#[test]
fn semaphore_release_wakes_timed_waiter() {
    init_logger();
    let sim = SimKernel::new(64 * 1024);
    let k = sim.kernel();
    let sem = k.semaphore_create(0, 10).unwrap();

    let outcome = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    sim.spawn("urgent", 3, move || {
        let res = k.semaphore_acquire(sem, 100);
        *slot.lock().unwrap() = Some((res, k.time()));
        loop {
            k.delay(1_000).unwrap();
        }
    });
    sim.spawn("background", 5, move || {
        k.delay(40).unwrap();
        k.semaphore_release(sem).unwrap();
        loop {
            k.delay(1_000).unwrap();
        }
    });

    sim.start();
    // The release chain needs no ticks beyond the 40th: the delay expiry
    // wakes the releaser, whose release immediately unblocks the waiter.
    sim.advance(40);

    let (res, at) = wait_for_value("waiter outcome", &outcome);
    assert_eq!(res, Ok(()));
    assert_eq!(at, 40);
}

/// A timed wait on a never-released semaphore fails with Timeout exactly at
/// its deadline, never earlier.
#[test]
fn semaphore_timeout_fires_at_deadline() {
    init_logger();
    let sim = SimKernel::new(64 * 1024);
    let k = sim.kernel();
    let sem = k.semaphore_create(0, 1).unwrap();

    let outcome = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    sim.spawn("waiter", 3, move || {
        let res = k.semaphore_acquire(sem, 25);
        *slot.lock().unwrap() = Some((res, k.time()));
        loop {
            k.delay(1_000).unwrap();
        }
    });

    sim.start();
    sim.advance(24);
    assert!(outcome.lock().unwrap().is_none(), "woke before the deadline");

    sim.advance(1);
    let (res, at) = wait_for_value("waiter outcome", &outcome);
    assert_eq!(res, Err(Error::Timeout));
    assert_eq!(at, 25);
}

/// Three equal-priority busy tasks share the CPU in creation order with
/// exactly one round-robin slice (5 ticks) each.
#[test]
fn equal_priority_round_robin() {
    init_logger();
    let sim = SimKernel::new(64 * 1024);
    let k = sim.kernel();
    let ids: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|name| {
            sim.spawn(name, 7, move || loop {
                // Any kernel call is a preemption point.
                let _ = k.time();
            })
        })
        .collect();

    sim.start();
    let mut samples = Vec::new();
    for _ in 0..30 {
        sim.advance(1);
        samples.push(sim.current_task_name());
    }

    // Run-time accounting: every peer got a share of the 30 ticks, and the
    // simulated tasks never touched their kernel-side stacks.
    for &id in &ids {
        let share = k.cpu_usage_permyriad(id).unwrap();
        assert!(share > 0 && share <= 10_000, "share = {share}");
        assert_eq!(k.stack_usage(id), Ok(0));
        assert_eq!(k.check_stack_overflow(id), Ok(false));
    }

    // The slice counter starts fresh, so the first rotation lands on tick
    // 5; every 5 ticks thereafter the next peer takes over.
    let mut expected = Vec::new();
    expected.extend(std::iter::repeat("A".to_string()).take(4));
    for name in ["B", "C", "A", "B", "C"] {
        expected.extend(std::iter::repeat(name.to_string()).take(5));
    }
    expected.push("A".to_string());
    assert_eq!(samples, expected);
}

/// `yield_now` rotates equal-priority peers immediately, without waiting
/// for the slice to expire.
#[test]
fn yield_rotates_equal_priority_peers() {
    init_logger();
    let sim = SimKernel::new(64 * 1024);
    let k = sim.kernel();
    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let ev = events.clone();
    sim.spawn("A", 7, move || {
        ev.lock().unwrap().push("a1");
        k.yield_now().unwrap();
        ev.lock().unwrap().push("a2");
        k.yield_now().unwrap();
        loop {
            k.delay(1_000).unwrap();
        }
    });
    let ev = events.clone();
    sim.spawn("B", 7, move || {
        ev.lock().unwrap().push("b1");
        k.yield_now().unwrap();
        ev.lock().unwrap().push("b2");
        k.yield_now().unwrap();
        loop {
            k.delay(1_000).unwrap();
        }
    });

    sim.start();
    wait_until("both tasks to take two turns", || {
        events.lock().unwrap().len() == 4
    });
    assert_eq!(*events.lock().unwrap(), vec!["a1", "b1", "a2", "b2"]);
}

/// Formatted output reaches the port's console byte sink, one atomic line
/// per print.
#[test]
fn kernel_print_reaches_console() {
    init_logger();
    let sim = SimKernel::new(64 * 1024);
    let k = sim.kernel();
    let printed = Arc::new(Mutex::new(None));

    let slot = printed.clone();
    sim.spawn("greeter", 5, move || {
        keel_kernel::kprintln!(k, "hello from {} at tick {}", "greeter", k.time());
        *slot.lock().unwrap() = Some(true);
        loop {
            k.delay(1_000).unwrap();
        }
    });

    sim.start();
    assert!(wait_for_value("the greeting", &printed));
    assert!(sim.output().contains("hello from greeter at tick 0\n"));
}

/// Chained priority inheritance: a low task holding a mutex wanted by a
/// high task runs ahead of a medium task until it releases.
#[test]
fn mutex_priority_inheritance() {
    init_logger();
    let sim = SimKernel::new(64 * 1024);
    let k = sim.kernel();
    let m = k.mutex_create().unwrap();

    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let ev = events.clone();
    let low = sim.spawn("low", 10, move || {
        k.mutex_lock(m, WAIT_FOREVER).unwrap();
        ev.lock().unwrap().push("low locked");
        // Keep running (at inherited priority, once "high" blocks) past the
        // medium task's wake-up at tick 10.
        while k.time() < 12 {}
        ev.lock().unwrap().push("low unlock");
        k.mutex_unlock(m).unwrap();
        loop {
            k.delay(1_000).unwrap();
        }
    });

    let ev = events.clone();
    let high = sim.spawn("high", 1, move || {
        k.delay(5).unwrap();
        ev.lock().unwrap().push("high wants it");
        k.mutex_lock(m, WAIT_FOREVER).unwrap();
        ev.lock().unwrap().push("high got it");
        k.mutex_unlock(m).unwrap();
        ev.lock().unwrap().push("high done");
        loop {
            k.delay(1_000).unwrap();
        }
    });

    let ev = events.clone();
    sim.spawn("medium", 5, move || {
        k.delay(10).unwrap();
        ev.lock().unwrap().push("medium ran");
        loop {
            k.delay(1_000).unwrap();
        }
    });

    sim.start();
    sim.advance(6);
    wait_until("high to block on the mutex", || {
        k.task_state(high) == Ok(TaskState::Blocked)
    });
    // The holder has inherited the waiter's priority.
    assert_eq!(k.task_priority(low), Ok(1));
    assert_eq!(k.task_base_priority(low), Ok(10));

    sim.advance(14);
    wait_until("the full hand-off to play out", || {
        events.lock().unwrap().len() == 6
    });
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "low locked",
            "high wants it",
            "low unlock",
            "high got it",
            "high done",
            "medium ran",
        ]
    );
    // The boost ended with the release.
    assert_eq!(k.task_priority(low), Ok(10));
}

/// Ticks delivered while the scheduler is suspended neither advance kernel
/// time nor rotate tasks; the deferred request fires on resume.
#[test]
fn scheduler_suspension_defers_everything() {
    init_logger();
    let sim = SimKernel::new(64 * 1024);
    let k = sim.kernel();
    for name in ["A", "B"] {
        sim.spawn(name, 7, move || loop {
            let _ = k.time();
        });
    }

    sim.start();
    assert_eq!(sim.current_task_name(), "A");

    k.suspend_scheduler();
    let before = k.time();
    sim.advance(10);
    assert_eq!(k.time(), before, "time advanced while suspended");
    assert_eq!(sim.current_task_name(), "A");

    k.resume_scheduler().unwrap();
    // Rotation resumes with the next ticks.
    sim.advance(5);
    assert_eq!(sim.current_task_name(), "B");
    assert_eq!(k.resume_scheduler(), Err(Error::InvalidState));
}

/// A wakeup arriving while the scheduler is suspended readies the task but
/// defers the switch until the matching resume.
#[test]
fn wakeups_during_suspension_are_deferred() {
    init_logger();
    let sim = SimKernel::new(64 * 1024);
    let k = sim.kernel();
    let sem = k.semaphore_create(0, 1).unwrap();

    let outcome = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    let waiter = sim.spawn("waiter", 3, move || {
        let res = k.semaphore_acquire(sem, WAIT_FOREVER);
        *slot.lock().unwrap() = Some(res);
        loop {
            k.delay(1_000).unwrap();
        }
    });
    sim.spawn("filler", 7, move || loop {
        let _ = k.time();
    });

    sim.start();
    wait_until("waiter to park on the semaphore", || {
        k.task_state(waiter) == Ok(TaskState::Blocked)
    });

    k.suspend_scheduler();
    k.semaphore_release(sem).unwrap();
    sim.advance(3);
    // Woken and ready, but the lower-priority filler still runs.
    assert_eq!(k.task_state(waiter), Ok(TaskState::Ready));
    assert_eq!(sim.current_task_name(), "filler");
    assert!(outcome.lock().unwrap().is_none());

    k.resume_scheduler().unwrap();
    assert_eq!(wait_for_value("deferred wakeup", &outcome), Ok(()));
}

/// Suspend/resume moves a task between the Ready and Suspended states and
/// keeps it off the CPU in between.
#[test]
fn suspend_resume_roundtrip() {
    init_logger();
    let sim = SimKernel::new(64 * 1024);
    let k = sim.kernel();
    let a = sim.spawn("A", 7, move || loop {
        let _ = k.time();
    });
    let b = sim.spawn("B", 7, move || loop {
        let _ = k.time();
    });

    sim.start();
    assert_eq!(k.task_state(a), Ok(TaskState::Ready));
    assert_eq!(k.task_state(b), Ok(TaskState::Ready));

    k.suspend_task(b).unwrap();
    assert_eq!(k.task_state(b), Ok(TaskState::Suspended));
    sim.advance(12);
    // With B parked, A no longer shares its level and keeps the CPU
    // through what would have been two rotations.
    assert_eq!(sim.current_task_name(), "A");

    k.resume_task(b).unwrap();
    assert_eq!(k.task_state(b), Ok(TaskState::Ready));
    assert_eq!(k.resume_task(b), Err(Error::InvalidState));
    sim.advance(5);
    assert_eq!(sim.current_task_name(), "B");
}
