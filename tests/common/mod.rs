//! Shared scaffolding for the integration tests under `tests/`: spawns a disposable helper
//! process per test and resolves the path to the `test_payload` fixture DLL, tearing both down
//! (or rather, just the process — the DLL is a build artifact) when the test returns.

use std::path::{Path, PathBuf};

/// Locates the `test_payload` cdylib built alongside this test binary.
///
/// Workspace members share one `target/<profile>` directory, and a cdylib's output lands there
/// directly (unlike the hashed object files under `target/<profile>/deps`), so climbing two
/// directories up from the current test binary's own path finds it reliably without needing an
/// artifact-dependency (`bindeps`) build.
pub fn payload_dll_path() -> PathBuf {
    let exe = std::env::current_exe().expect("failed to resolve current test binary's path");
    let target_dir = exe
        .parent()
        .and_then(Path::parent)
        .expect("test binary is not nested under target/<profile>/deps");
    let candidate = target_dir.join("test_payload.dll");
    assert!(
        candidate.is_file(),
        "test_payload.dll not found at {candidate:?} -- build the workspace before running tests"
    );
    candidate
}

/// Defines one `#[test]` that spawns a fresh `test_target` helper process, opens it as a
/// [`dll_syringe::Process`], resolves the payload DLL's path, runs `$body`, then tears the helper
/// process down regardless of whether the body panicked.
#[macro_export]
macro_rules! syringe_test {
    (fn $name:ident(
        $process_ident:ident: Process,
        $payload_ident:ident: &Path,
    ) $body:block) => {
        #[test]
        fn $name() {
            let _ = env_logger::builder().is_test(true).try_init();

            let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_test_target"))
                .spawn()
                .expect("failed to spawn test_target helper process");

            // Give the helper a moment to finish starting its background thread before the test
            // body starts poking at it.
            std::thread::sleep(std::time::Duration::from_millis(100));

            let $process_ident = dll_syringe::Process::open(child.id(), dll_syringe::access::INJECT_ACCESS)
                .expect("failed to open test_target helper process");
            let payload_path_buf = common::payload_dll_path();
            let $payload_ident: &std::path::Path = payload_path_buf.as_path();

            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| $body));

            let _ = child.kill();
            let _ = child.wait();

            if let Err(err) = result {
                std::panic::resume_unwind(err);
            }
        }
    };
}
