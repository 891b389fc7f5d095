//! The five injection strategies, behind one trait object rather than an inheritance hierarchy.

mod classic_thread;
mod manual_map_strategy;
mod native_thread;
mod queue_apc;
mod thread_hijack;

use std::path::Path;

use winapi::shared::minwindef::HMODULE;

use crate::{error::SyringeError, process_ref::ProcessRef};

/// Which of the five strategies produced (or should produce) an [`InjectionOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    ClassicThread,
    NativeThread,
    QueueApc,
    ManualMap,
    ThreadHijack,
}

impl StrategyKind {
    /// All five strategies, in the order the specification lists them (S1..S5).
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::ClassicThread,
        StrategyKind::NativeThread,
        StrategyKind::QueueApc,
        StrategyKind::ManualMap,
        StrategyKind::ThreadHijack,
    ];

    /// The `method` integer (0..4) the profile store's on-disk JSON schema uses, in `ALL`'s order.
    pub const fn to_method_code(self) -> u8 {
        match self {
            StrategyKind::ClassicThread => 0,
            StrategyKind::NativeThread => 1,
            StrategyKind::QueueApc => 2,
            StrategyKind::ManualMap => 3,
            StrategyKind::ThreadHijack => 4,
        }
    }

    /// The inverse of [`Self::to_method_code`]; `None` for any code outside `0..=4`.
    pub const fn from_method_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(StrategyKind::ClassicThread),
            1 => Some(StrategyKind::NativeThread),
            2 => Some(StrategyKind::QueueApc),
            3 => Some(StrategyKind::ManualMap),
            4 => Some(StrategyKind::ThreadHijack),
            _ => None,
        }
    }
}

/// The shape every successful injection or ejection reports.
///
/// Failures are carried as `Err(SyringeError)` rather than a `Failure` variant here: a tagged
/// union folded into this type would just duplicate what `Result` already gives for free.
#[derive(Debug, Clone, Copy)]
pub struct InjectionOutcome {
    /// The resulting module handle in the target, when one is meaningful (not for S3/S5, which
    /// do not synchronise on the load completing).
    pub remote_module: Option<HMODULE>,
    /// The base address the module ended up loaded at.
    pub base_address: u64,
    /// The mapped image size, when known (manual map only; zero for loader-based strategies).
    pub mapped_size: u64,
    /// Which strategy produced this outcome.
    pub strategy_used: StrategyKind,
}

unsafe impl Send for InjectionOutcome {}

/// Advisory checkpoint callback a caller may supply; strategies call it at coarse milestones.
/// Not a cancellation channel (see SPEC_FULL §5).
pub trait ProgressSink {
    fn on_checkpoint(&self, checkpoint: &str);
}

impl<F: Fn(&str)> ProgressSink for F {
    fn on_checkpoint(&self, checkpoint: &str) {
        self(checkpoint)
    }
}

/// No-op sink for callers who don't want progress checkpoints.
pub struct NoopSink;
impl ProgressSink for NoopSink {
    fn on_checkpoint(&self, _checkpoint: &str) {}
}

/// The contract every injection strategy implements.
pub trait InjectionMethod {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn requires_admin(&self) -> bool;
    fn supports_x86(&self) -> bool;
    fn supports_x64(&self) -> bool;

    fn inject(
        &self,
        process: ProcessRef<'_>,
        dll_path: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<InjectionOutcome, SyringeError>;

    fn eject(
        &self,
        process: ProcessRef<'_>,
        module: HMODULE,
    ) -> Result<InjectionOutcome, SyringeError>;
}

/// Resolves a [`StrategyKind`] to its implementer.
pub fn method(kind: StrategyKind) -> Box<dyn InjectionMethod> {
    match kind {
        StrategyKind::ClassicThread => Box::new(classic_thread::ClassicThread),
        StrategyKind::NativeThread => Box::new(native_thread::NativeThread),
        StrategyKind::QueueApc => Box::new(queue_apc::QueueApc),
        StrategyKind::ManualMap => Box::new(manual_map_strategy::ManualMapStrategy::default()),
        StrategyKind::ThreadHijack => Box::new(thread_hijack::ThreadHijack),
    }
}

/// Shared helper: checks a strategy's architecture support flags against the target, up front.
pub(crate) fn check_arch_support(
    method: &dyn InjectionMethod,
    process: ProcessRef<'_>,
) -> Result<(), SyringeError> {
    let is_x86 = process.is_x86()?;
    let supported = if is_x86 {
        method.supports_x86()
    } else {
        method.supports_x64()
    };
    if !supported {
        return Err(SyringeError::UnsupportedTarget);
    }
    Ok(())
}
