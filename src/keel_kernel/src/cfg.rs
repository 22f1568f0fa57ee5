//! Compile-time kernel configuration.
//!
//! Every knob is a plain constant so the whole kernel monomorphizes to the
//! chosen configuration. The `const` assertions below reject values outside
//! the supported ranges at build time.

/// Number of task priority levels. Priority 0 is the most urgent.
pub const PRIORITY_COUNT: usize = 16;

/// The lowest priority level, reserved for the idle task.
pub const PRIORITY_IDLE: u8 = (PRIORITY_COUNT - 1) as u8;

/// Heap and stack alignment in bytes.
pub const ALIGN: usize = 8;

/// Capacity of a task name, in bytes.
pub const TASK_NAME_CAPACITY: usize = 16;

/// Nominal tick frequency in hertz. The kernel itself only counts ticks;
/// this is advertised so ports can program their tick timer.
pub const TICK_HZ: u32 = 1000;

/// Maximum number of concurrently live tasks, including the idle task.
pub const TASK_POOL_CAPACITY: usize = 16;

pub const SEMAPHORE_POOL_CAPACITY: usize = 8;
pub const MUTEX_POOL_CAPACITY: usize = 8;
pub const QUEUE_POOL_CAPACITY: usize = 8;
pub const TIMER_POOL_CAPACITY: usize = 8;

/// Ticks a task may run before rotating among equal-priority peers.
pub const ROUND_ROBIN_SLICE: u32 = 5;

/// Stack size of the idle task, in bytes.
pub const IDLE_STACK_SIZE: usize = 1024;

/// Bound on the mutex priority-inheritance chain walk.
pub const MUTEX_CHAIN_DEPTH_MAX: usize = 8;

const _: () = assert!(
    PRIORITY_COUNT == 8 || PRIORITY_COUNT == 16 || PRIORITY_COUNT == 32 || PRIORITY_COUNT == 64
);
const _: () = assert!(ALIGN == 4 || ALIGN == 8);
const _: () = assert!(TASK_NAME_CAPACITY >= 4 && TASK_NAME_CAPACITY <= 32);
const _: () = assert!(TASK_POOL_CAPACITY >= 2 && TASK_POOL_CAPACITY <= 255);
const _: () = assert!(ROUND_ROBIN_SLICE >= 1);
