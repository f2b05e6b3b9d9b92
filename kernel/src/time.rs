//! Tick counter.
//!
//! Stand-in for the timer interrupt: the simulation advances ticks
//! explicitly. The ticks lock is the innermost lock in the kernel and is
//! safe to take from any context.

use lazy_static::lazy_static;
use spin::Mutex;

lazy_static! {
    static ref TICKS: Mutex<u64> = Mutex::new(0);
}

/// Current tick count.
pub fn ticks() -> u64 {
    *TICKS.lock()
}

/// Advance the clock by one tick.
pub fn tick() {
    *TICKS.lock() += 1;
}

/// Reset the clock to zero (boot).
pub fn init() {
    *TICKS.lock() = 0;
}
