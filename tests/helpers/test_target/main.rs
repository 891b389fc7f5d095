//! Helper process spawned by integration tests as an injection target.
//!
//! Does nothing on its own besides staying alive, making visible forward progress on a
//! background thread (for the thread-hijack test to observe), and parking its main thread in an
//! alertable wait (for the queued-APC strategy to have somewhere to land).

use std::{
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::Duration,
};

use winapi::um::synchapi::SleepEx;

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn main() {
    thread::spawn(|| loop {
        COUNTER.fetch_add(1, Ordering::Relaxed);
        thread::yield_now();
    });

    loop {
        // `bAlertable = TRUE`: queued APCs run here rather than the sleep simply resuming.
        unsafe {
            SleepEx(Duration::from_millis(50).as_millis() as u32, 1);
        }
    }
}
