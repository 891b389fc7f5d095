use std::time::Duration;

use dll_syringe::{ProcessEvent, ProcessMonitor};

#[allow(unused)]
mod common;

#[test]
fn observes_start_and_termination_of_a_real_process() {
    let _ = env_logger::builder().is_test(true).try_init();

    let monitor = ProcessMonitor::new();
    monitor.set_polling_interval(50);
    monitor.watch_process("test_target.exe");

    let rx = monitor.start().unwrap();

    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_test_target"))
        .spawn()
        .expect("failed to spawn test_target helper process");

    let mut saw_start = false;
    let mut saw_stop = false;

    // Either order is acceptable: the helper may be killed before the next poll observes its
    // start, in which case only the terminated event (for a pid never reported as started) would
    // arrive -- so we only assert on whatever start event we do see.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline && !saw_start {
        if let Ok(ProcessEvent::Started(descriptor)) = rx.recv_timeout(Duration::from_millis(200)) {
            assert_eq!(descriptor.pid, child.id());
            saw_start = true;
        }
    }
    assert!(saw_start, "expected a Started event for the spawned helper process");

    child.kill().unwrap();
    child.wait().unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline && !saw_stop {
        if let Ok(ProcessEvent::Terminated(descriptor)) = rx.recv_timeout(Duration::from_millis(200))
        {
            if descriptor.pid == child.id() {
                saw_stop = true;
            }
        }
    }
    assert!(saw_stop, "expected a Terminated event for the killed helper process");

    monitor.stop();
}

#[test]
fn stop_before_start_is_a_harmless_no_op() {
    let monitor = ProcessMonitor::new();
    monitor.stop();
    assert!(!monitor.is_running());
}

#[test]
fn starting_twice_returns_invalid_argument() {
    let monitor = ProcessMonitor::new();
    let _rx = monitor.start().unwrap();
    let result = monitor.start();
    assert!(result.is_err());
    monitor.stop();
}
