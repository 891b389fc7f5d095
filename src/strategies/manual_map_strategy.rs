//! S4: thin [`InjectionMethod`] wrapper around [`crate::manual_mapper::ManualMapper`].

use std::path::Path;

use winapi::shared::minwindef::HMODULE;

use crate::{
    error::SyringeError,
    manual_mapper::{ManualMapFlags, ManualMapper},
    process_ref::ProcessRef,
    strategies::{InjectionMethod, InjectionOutcome, ProgressSink, StrategyKind},
};

#[derive(Debug, Default)]
pub struct ManualMapStrategy {
    mapper: ManualMapper,
    flags: ManualMapFlags,
}

impl ManualMapStrategy {
    /// Builds a manual-map strategy with a specific flag set instead of [`ManualMapFlags::DEFAULT`].
    pub fn with_flags(flags: ManualMapFlags) -> Self {
        Self {
            mapper: ManualMapper,
            flags,
        }
    }
}

impl InjectionMethod for ManualMapStrategy {
    fn name(&self) -> &'static str {
        "manual_map"
    }

    fn description(&self) -> &'static str {
        "user-mode PE mapping without registering the module with the loader"
    }

    fn requires_admin(&self) -> bool {
        false
    }

    fn supports_x86(&self) -> bool {
        true
    }

    fn supports_x64(&self) -> bool {
        true
    }

    fn inject(
        &self,
        process: ProcessRef<'_>,
        dll_path: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<InjectionOutcome, SyringeError> {
        let outcome = self.mapper.map(process, dll_path, self.flags)?;
        sink.on_checkpoint("mapped");

        Ok(InjectionOutcome {
            remote_module: Some(outcome.base_address as HMODULE),
            base_address: outcome.base_address,
            mapped_size: outcome.mapped_size,
            strategy_used: StrategyKind::ManualMap,
        })
    }

    fn eject(
        &self,
        process: ProcessRef<'_>,
        module: HMODULE,
    ) -> Result<InjectionOutcome, SyringeError> {
        self.mapper.unmap(process, module as u64)?;
        Ok(InjectionOutcome {
            remote_module: None,
            base_address: module as u64,
            mapped_size: 0,
            strategy_used: StrategyKind::ManualMap,
        })
    }
}
