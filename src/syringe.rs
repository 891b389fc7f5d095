//! The main entry point: ties a target process and an [`crate::strategies::StrategyKind`]
//! together and exposes `inject`/`eject` without requiring callers to touch the strategy trait
//! objects directly.

use std::{io, path::Path};

use winapi::shared::winerror::ERROR_MOD_NOT_FOUND;

use crate::{
    error::SyringeError,
    process::Process,
    process_module::ProcessModule,
    process_ref::ProcessRef,
    strategies::{self, InjectionOutcome, NoopSink, ProgressSink, StrategyKind},
};

/// Validates that `path` exists before any remote operation is attempted, surfacing a
/// [`SyringeError::RemoteIo`] that carries the same OS error code a remote `LoadLibraryW` call
/// would fail with for a module that cannot be found (`ERROR_MOD_NOT_FOUND`), rather than failing
/// deeper inside a remote allocation or thread-creation call with a less specific error.
fn validate_payload_path(path: &Path) -> Result<(), SyringeError> {
    if !path.is_file() {
        return Err(SyringeError::RemoteIo(io::Error::from_raw_os_error(
            ERROR_MOD_NOT_FOUND as i32,
        )));
    }
    Ok(())
}

/// An injector bound to one target process and one [`StrategyKind`].
///
/// Cheap to construct; all the state it carries is the borrowed [`ProcessRef`] and the selected
/// strategy, so a caller can freely build a new one per injection rather than needing to reuse it
/// for performance.
#[derive(Debug, Clone, Copy)]
pub struct Syringe<'a> {
    process: ProcessRef<'a>,
    strategy: StrategyKind,
}

impl<'a> Syringe<'a> {
    /// Creates a syringe targeting `process`, defaulting to the classic
    /// `CreateRemoteThread` + `LoadLibraryW` strategy.
    pub fn for_process(process: &'a Process) -> Self {
        Self {
            process: process.as_ref(),
            strategy: StrategyKind::ClassicThread,
        }
    }

    /// Creates a syringe targeting `process` using a specific strategy.
    pub fn with_strategy(process: &'a Process, strategy: StrategyKind) -> Self {
        Self {
            process: process.as_ref(),
            strategy,
        }
    }

    /// The strategy this syringe will use for the next `inject`/`eject` call.
    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    /// Changes the strategy used for subsequent `inject`/`eject` calls.
    pub fn set_strategy(&mut self, strategy: StrategyKind) {
        self.strategy = strategy;
    }

    fn precheck(&self, payload_path: &Path) -> Result<(), SyringeError> {
        validate_payload_path(payload_path)?;
        if !self.process.is_alive() {
            return Err(SyringeError::ProcessInaccessible);
        }
        Ok(())
    }

    /// Injects `payload_path` into the target process using the configured strategy, without
    /// progress checkpoints.
    pub fn inject(
        &mut self,
        payload_path: impl AsRef<Path>,
    ) -> Result<InjectedModule<'a>, SyringeError> {
        self.inject_with_sink(payload_path, &NoopSink)
    }

    /// Like [`Self::inject`], additionally reporting coarse progress checkpoints to `sink`.
    pub fn inject_with_sink(
        &mut self,
        payload_path: impl AsRef<Path>,
        sink: &dyn ProgressSink,
    ) -> Result<InjectedModule<'a>, SyringeError> {
        let payload_path = payload_path.as_ref();
        self.precheck(payload_path)?;

        let method = strategies::method(self.strategy);
        let outcome = method.inject(self.process, payload_path, sink)?;

        Ok(InjectedModule {
            process: self.process,
            strategy: self.strategy,
            outcome,
        })
    }

    /// Ejects a previously injected module from the target process.
    pub fn eject(&mut self, module: InjectedModule<'a>) -> Result<(), SyringeError> {
        if !self.process.is_alive() {
            return Err(SyringeError::ProcessInaccessible);
        }
        let handle = module
            .outcome
            .remote_module
            .ok_or(SyringeError::ModuleNotFound)?;
        let method = strategies::method(module.strategy);
        method.eject(self.process, handle)?;
        Ok(())
    }
}

/// A module successfully injected into a target process.
#[derive(Debug, Clone, Copy)]
pub struct InjectedModule<'a> {
    process: ProcessRef<'a>,
    strategy: StrategyKind,
    outcome: InjectionOutcome,
}

impl<'a> InjectedModule<'a> {
    /// The strategy that produced this injection.
    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    /// The base address the module ended up loaded at in the target process.
    pub fn base_address(&self) -> u64 {
        self.outcome.base_address
    }

    /// The mapped image size, when known (manual map only; zero otherwise).
    pub fn mapped_size(&self) -> u64 {
        self.outcome.mapped_size
    }

    /// Looks up the live [`ProcessModule`] for this injection in the target process, when the
    /// strategy produced a module handle (all strategies except queued-APC and thread-hijack,
    /// which do not synchronise on the load completing).
    pub fn module(&self) -> Result<Option<ProcessModule<'a>>, SyringeError> {
        match self.outcome.remote_module {
            Some(handle) => Ok(self
                .process
                .modules()?
                .into_iter()
                .find(|m| m.handle() == handle)),
            None => Ok(None),
        }
    }
}

#[cfg(all(test, feature = "sync_send_syringe"))]
mod tests {
    #[test]
    fn syringe_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<super::Syringe<'static>>();
    }
}
