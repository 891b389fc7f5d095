//! C10: composes the process monitor behind a rule engine, dispatching matched `Started` events
//! into an injection strategy on a small bounded worker pool.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    error::SyringeError,
    process::{access, Process, ProcessDescriptor},
    process_monitor::{ProcessEvent, ProcessMonitor},
    strategies::StrategyKind,
    syringe::Syringe,
    utils::fold_name,
};

/// Default number of worker threads draining matched `Started` events, replacing the ported
/// system's unbounded thread-per-event spawn (see `SPEC_FULL.md` §9's redesign note).
const DEFAULT_WORKER_POOL_SIZE: usize = 4;

/// One `(process name, dll, strategy, delay)` rule the auto-injector matches `Started` events
/// against. `process_name` is folded to lowercase at construction; comparisons never re-fold it.
#[derive(Debug, Clone)]
pub struct InjectionRule {
    /// Lowercase process file name this rule matches against.
    pub process_name: String,
    /// Path to the DLL to inject when the rule fires.
    pub dll_path: PathBuf,
    /// Which strategy to inject with.
    pub strategy: StrategyKind,
    /// Milliseconds to wait after the process is observed before injecting.
    pub delay_ms: u32,
}

/// Running totals of auto-injection attempts, updated under a mutex as each job completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Every attempted auto-injection, successful or not.
    pub total_attempts: u32,
    /// Attempts for which the underlying strategy reported success.
    pub successful_injections: u32,
    /// Attempts for which the underlying strategy reported failure.
    pub failed_injections: u32,
}

struct Inner {
    monitor: ProcessMonitor,
    rules: Mutex<Vec<InjectionRule>>,
    stats: Mutex<Statistics>,
    running: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    worker_pool_size: usize,
}

/// Watches process creation for rule matches and fires injections against them.
///
/// Cheaply [`Clone`]-able: all state lives behind an `Arc`, so a handle can be shared with
/// whatever owns the surrounding application without needing a `&'static` reference.
#[derive(Debug, Clone)]
pub struct AutoInjector {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("worker_pool_size", &self.worker_pool_size)
            .field("rules", &self.rules.lock().len())
            .finish()
    }
}

impl Default for AutoInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoInjector {
    /// Creates an auto-injector with no rules and the default worker pool size.
    pub fn new() -> Self {
        Self::with_worker_pool_size(DEFAULT_WORKER_POOL_SIZE)
    }

    /// Creates an auto-injector whose dispatch pool has `size` worker threads (clamped to at
    /// least one).
    pub fn with_worker_pool_size(size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                monitor: ProcessMonitor::new(),
                rules: Mutex::new(Vec::new()),
                stats: Mutex::new(Statistics::default()),
                running: AtomicBool::new(false),
                dispatcher: Mutex::new(None),
                worker_pool_size: size.max(1),
            }),
        }
    }

    /// Adds a rule, folding `process_name` to lowercase. If already running, the underlying
    /// monitor's watch list is updated immediately.
    pub fn add_rule(
        &self,
        process_name: &str,
        dll_path: impl Into<PathBuf>,
        strategy: StrategyKind,
        delay_ms: u32,
    ) {
        let folded = fold_name(process_name);
        self.inner.rules.lock().push(InjectionRule {
            process_name: folded.clone(),
            dll_path: dll_path.into(),
            strategy,
            delay_ms,
        });
        if self.inner.running.load(Ordering::SeqCst) {
            self.inner.monitor.watch_process(&folded);
        }
        log::info!("added auto-inject rule for: {process_name}");
    }

    /// Removes every rule matching `process_name` (folded) and unwatches it.
    pub fn remove_rule(&self, process_name: &str) {
        let folded = fold_name(process_name);
        self.inner
            .rules
            .lock()
            .retain(|rule| rule.process_name != folded);
        self.inner.monitor.unwatch_process(&folded);
        log::info!("removed auto-inject rule for: {process_name}");
    }

    /// Removes every rule and clears the watch list.
    pub fn clear_rules(&self) {
        self.inner.rules.lock().clear();
        self.inner.monitor.clear_watch_list();
    }

    /// The current rule set.
    pub fn rules(&self) -> Vec<InjectionRule> {
        self.inner.rules.lock().clone()
    }

    /// Starts the underlying process monitor and the dispatch thread. A no-op if already running.
    pub fn start(&self) -> Result<(), SyringeError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for rule in self.inner.rules.lock().iter() {
            self.inner.monitor.watch_process(&rule.process_name);
        }

        let rx = match self.inner.monitor.start() {
            Ok(rx) => rx,
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let inner = Arc::clone(&self.inner);
        let handle = thread::spawn(move || dispatch_loop(inner, rx));
        *self.inner.dispatcher.lock() = Some(handle);
        Ok(())
    }

    /// Stops the dispatch thread and the underlying monitor, and joins both. A no-op if not
    /// running.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.monitor.stop();
        if let Some(handle) = self.inner.dispatcher.lock().take() {
            let _ = handle.join();
        }
    }

    /// Whether the dispatch thread and monitor are currently running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// A snapshot of the running totals.
    pub fn statistics(&self) -> Statistics {
        *self.inner.stats.lock()
    }
}

type Job = (ProcessDescriptor, InjectionRule);

fn dispatch_loop(inner: Arc<Inner>, rx: mpsc::Receiver<ProcessEvent>) {
    let (job_tx, job_rx) = mpsc::sync_channel::<Job>(inner.worker_pool_size);
    let job_rx = Arc::new(Mutex::new(job_rx));

    let workers: Vec<_> = (0..inner.worker_pool_size)
        .map(|_| {
            let job_rx = Arc::clone(&job_rx);
            let inner = Arc::clone(&inner);
            thread::spawn(move || worker_loop(inner, job_rx))
        })
        .collect();

    while let Ok(event) = rx.recv() {
        let ProcessEvent::Started(process) = event else {
            continue;
        };
        let folded = fold_name(&process.name);
        let rule = inner
            .rules
            .lock()
            .iter()
            .find(|rule| rule.process_name == folded)
            .cloned();

        let Some(rule) = rule else { continue };
        log::info!(
            "auto-inject triggered for {} (pid {})",
            process.name,
            process.pid
        );
        if job_tx.send((process, rule)).is_err() {
            break;
        }
    }

    drop(job_tx);
    for worker in workers {
        let _ = worker.join();
    }
}

fn worker_loop(inner: Arc<Inner>, job_rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = job_rx.lock().recv();
        match job {
            Ok((process, rule)) => perform_injection(&inner, process, rule),
            Err(_) => break,
        }
    }
}

fn perform_injection(inner: &Inner, process: ProcessDescriptor, rule: InjectionRule) {
    if rule.delay_ms > 0 {
        thread::sleep(Duration::from_millis(rule.delay_ms as u64));
    }

    inner.stats.lock().total_attempts += 1;

    let result = Process::open(process.pid, access::INJECT_ACCESS).and_then(|target| {
        Syringe::with_strategy(&target, rule.strategy)
            .inject(&rule.dll_path)
            .map(|_module| ())
    });

    let mut stats = inner.stats.lock();
    match result {
        Ok(_) => {
            stats.successful_injections += 1;
            log::info!("auto-injection successful: {}", process.name);
        }
        Err(err) => {
            stats.failed_injections += 1;
            log::error!("auto-injection failed for {}: {err}", process.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn add_rule_folds_process_name_and_statistics_start_at_zero() {
        let injector = AutoInjector::new();
        injector.add_rule("Calc.EXE", Path::new("payload.dll"), StrategyKind::NativeThread, 250);

        let rules = injector.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].process_name, "calc.exe");
        assert_eq!(rules[0].strategy, StrategyKind::NativeThread);
        assert_eq!(rules[0].delay_ms, 250);

        assert_eq!(injector.statistics(), Statistics::default());
        assert!(!injector.is_running());
    }

    #[test]
    fn remove_rule_is_case_insensitive() {
        let injector = AutoInjector::new();
        injector.add_rule("calc.exe", Path::new("payload.dll"), StrategyKind::ClassicThread, 0);
        injector.remove_rule("CALC.exe");
        assert!(injector.rules().is_empty());
    }

    #[test]
    fn clear_rules_empties_the_rule_set() {
        let injector = AutoInjector::new();
        injector.add_rule("a.exe", Path::new("a.dll"), StrategyKind::ClassicThread, 0);
        injector.add_rule("b.exe", Path::new("b.dll"), StrategyKind::QueueApc, 0);
        injector.clear_rules();
        assert!(injector.rules().is_empty());
    }
}
