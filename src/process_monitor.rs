//! C9: a background poller that diffs the process table against a known-pid baseline and
//! surfaces start/terminate events for a watched set of process names.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use winapi::um::winnt::PROCESS_QUERY_LIMITED_INFORMATION;

use crate::{
    error::SyringeError,
    process::{self, Process, ProcessDescriptor},
    utils::fold_name,
};

const DEFAULT_POLLING_INTERVAL_MS: u32 = 1000;

/// A process start or termination observed by a [`ProcessMonitor`], already filtered against
/// its watch list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A previously-unseen pid appeared in the process table.
    Started(ProcessDescriptor),
    /// A known pid disappeared, or its handle now reports an exit code other than `STILL_ACTIVE`.
    Terminated(ProcessDescriptor),
}

/// Polls the process table on its own thread and pushes [`ProcessEvent`]s for watched process
/// names over an `mpsc` channel, rather than invoking a callback directly on the poller thread
/// (see `SPEC_FULL.md` §9's process-monitor-event-bus redesign note) — a slow consumer can never
/// block the next poll.
pub struct ProcessMonitor {
    running: Arc<AtomicBool>,
    watch_list: Arc<Mutex<HashSet<String>>>,
    polling_interval_ms: Arc<AtomicU32>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

// `JoinHandle` doesn't implement `Debug`, so this is hand-written rather than derived.
impl std::fmt::Debug for ProcessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMonitor")
            .field("running", &self.is_running())
            .field("watch_list", &self.watch_list())
            .field("polling_interval_ms", &self.polling_interval_ms())
            .finish()
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMonitor {
    /// Creates a monitor with an empty watch list and the default 1000 ms polling interval. The
    /// poller thread does not start until [`Self::start`] is called.
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            watch_list: Arc::new(Mutex::new(HashSet::new())),
            polling_interval_ms: Arc::new(AtomicU32::new(DEFAULT_POLLING_INTERVAL_MS)),
            thread: Mutex::new(None),
        }
    }

    /// Starts the poller thread, returning the receiving end of its event channel.
    ///
    /// The poller's first scan runs on the poller thread before it enters its sleep/check loop,
    /// so an already-running watched process fires a `Started` event too — this matches the
    /// ported system's behaviour, which does not special-case the first scan.
    ///
    /// There is exactly one consumer per monitor. Calling `start` again while already running
    /// returns [`SyringeError::InvalidArgument`] rather than a second receiver.
    pub fn start(&self) -> Result<mpsc::Receiver<ProcessEvent>, SyringeError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SyringeError::InvalidArgument(
                "process monitor is already running".into(),
            ));
        }

        let (tx, rx) = mpsc::channel();
        let running = Arc::clone(&self.running);
        let watch_list = Arc::clone(&self.watch_list);
        let interval = Arc::clone(&self.polling_interval_ms);

        let handle = thread::spawn(move || monitor_thread(running, watch_list, interval, tx));
        *self.thread.lock().unwrap() = Some(handle);
        Ok(rx)
    }

    /// Cooperatively stops the poller thread and joins it. A no-op if not running.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Whether the poller thread is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Adds a process file name (case-insensitive) to the watch list.
    pub fn watch_process(&self, process_name: &str) {
        self.watch_list
            .lock()
            .unwrap()
            .insert(fold_name(process_name));
    }

    /// Removes a process file name from the watch list.
    pub fn unwatch_process(&self, process_name: &str) {
        self.watch_list
            .lock()
            .unwrap()
            .remove(&fold_name(process_name));
    }

    /// Empties the watch list.
    pub fn clear_watch_list(&self) {
        self.watch_list.lock().unwrap().clear();
    }

    /// The current watch list, folded to lowercase.
    pub fn watch_list(&self) -> Vec<String> {
        self.watch_list.lock().unwrap().iter().cloned().collect()
    }

    /// Changes the polling interval; takes effect from the next sleep onward. Default 1000 ms.
    pub fn set_polling_interval(&self, interval_ms: u32) {
        self.polling_interval_ms.store(interval_ms, Ordering::SeqCst);
    }

    /// The current polling interval in milliseconds.
    pub fn polling_interval_ms(&self) -> u32 {
        self.polling_interval_ms.load(Ordering::SeqCst)
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_thread(
    running: Arc<AtomicBool>,
    watch_list: Arc<Mutex<HashSet<String>>>,
    interval: Arc<AtomicU32>,
    tx: mpsc::Sender<ProcessEvent>,
) {
    let mut known: HashMap<u32, ProcessDescriptor> = HashMap::new();

    check_for_new_processes(&mut known, &watch_list, &tx);

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(
            interval.load(Ordering::SeqCst) as u64
        ));
        if !running.load(Ordering::SeqCst) {
            break;
        }
        check_for_new_processes(&mut known, &watch_list, &tx);
        check_for_terminated_processes(&mut known, &watch_list, &tx);
    }
}

fn is_watched(watch_list: &Mutex<HashSet<String>>, name: &str) -> bool {
    watch_list.lock().unwrap().contains(&fold_name(name))
}

fn check_for_new_processes(
    known: &mut HashMap<u32, ProcessDescriptor>,
    watch_list: &Mutex<HashSet<String>>,
    tx: &mpsc::Sender<ProcessEvent>,
) {
    let descriptors = match process::enumerate() {
        Ok(descriptors) => descriptors,
        Err(err) => {
            log::warn!("process monitor: snapshot failed: {err}");
            return;
        }
    };

    for descriptor in descriptors {
        if known.contains_key(&descriptor.pid) {
            continue;
        }
        let watched = is_watched(watch_list, &descriptor.name);
        known.insert(descriptor.pid, descriptor.clone());
        if watched {
            let _ = tx.send(ProcessEvent::Started(descriptor));
        }
    }
}

fn check_for_terminated_processes(
    known: &mut HashMap<u32, ProcessDescriptor>,
    watch_list: &Mutex<HashSet<String>>,
    tx: &mpsc::Sender<ProcessEvent>,
) {
    let mut terminated = Vec::new();

    for (&pid, descriptor) in known.iter() {
        let still_running = Process::open(pid, PROCESS_QUERY_LIMITED_INFORMATION)
            .map(|p| p.as_ref().is_alive())
            .unwrap_or(false);

        if !still_running {
            terminated.push(pid);
            if is_watched(watch_list, &descriptor.name) {
                let _ = tx.send(ProcessEvent::Terminated(descriptor.clone()));
            }
        }
    }

    for pid in terminated {
        known.remove(&pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_list_is_case_folded() {
        let monitor = ProcessMonitor::new();
        monitor.watch_process("Notepad.EXE");
        assert_eq!(monitor.watch_list(), vec!["notepad.exe".to_string()]);
        assert!(!monitor.is_running());

        monitor.unwatch_process("NOTEPAD.exe");
        assert!(monitor.watch_list().is_empty());
    }

    #[test]
    fn default_polling_interval_is_one_second() {
        let monitor = ProcessMonitor::new();
        assert_eq!(monitor.polling_interval_ms(), DEFAULT_POLLING_INTERVAL_MS);
        monitor.set_polling_interval(250);
        assert_eq!(monitor.polling_interval_ms(), 250);
    }
}
