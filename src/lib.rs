#![cfg(windows)]
#![warn(
    unsafe_op_in_unsafe_fn,
    missing_debug_implementations,
    missing_copy_implementations,
    clippy::missing_const_for_fn,
    rust_2018_idioms,
    clippy::todo,
    clippy::manual_assert,
    clippy::must_use_candidate,
    clippy::inconsistent_struct_constructor,
    clippy::wrong_self_convention,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]
#![allow(
    clippy::module_inception,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::borrow_as_ptr
)]

//! A Windows DLL injection library supporting multiple injection strategies, a user-mode manual
//! PE mapper, anti-detection passes, process monitoring and an automatic injector driven by a
//! profile store.

mod syringe;
pub use syringe::*;

mod process;
pub use process::*;

mod process_ref;
pub use process_ref::*;

mod process_module;
pub use process_module::*;

mod pe_image;
pub use pe_image::{DebugInfo, ImportDescriptor, ImportThunk, Machine, PeImage, RelocationEntry, SectionDescriptor, TlsInfo, VersionInfo};

mod remote_memory;

mod shellcode;

mod loader;
pub use loader::LoaderEntry;

pub mod strategies;

mod manual_mapper;
pub use manual_mapper::{ManualMapFlags, ManualMapper};

mod anti_detection;
pub use anti_detection::{AntiDetectTechnique, AntiDetection};

mod process_monitor;
pub use process_monitor::{ProcessEvent, ProcessMonitor};

mod auto_injector;
pub use auto_injector::{AutoInjector, InjectionRule, Statistics};

mod profile;
pub use profile::{InjectionProfile, ProfileStore};

#[cfg_attr(not(feature = "process_memory"), allow(dead_code))]
#[cfg(feature = "process_memory")]
/// Module containing utilities for dealing with memory of another process.
pub mod process_memory;
#[cfg(not(feature = "process_memory"))]
/// Module containing utilities for dealing with memory of another process.
pub(crate) mod process_memory;

pub(crate) mod utils;

/// Module containing the error enums used in this crate.
pub mod error;
