use dll_syringe::{ManualMapFlags, ManualMapper};

#[allow(unused)]
mod common;

syringe_test! {
    fn map_with_default_flags_succeeds(
        process: Process,
        payload_path: &Path,
    ) {
        let mapper = ManualMapper::default();
        let outcome = mapper.map(process.as_ref(), payload_path, ManualMapFlags::default()).unwrap();
        assert_ne!(outcome.base_address, 0);
        assert_ne!(outcome.mapped_size, 0);
    }
}

syringe_test! {
    fn map_with_stealth_flags_succeeds(
        process: Process,
        payload_path: &Path,
    ) {
        let mapper = ManualMapper::default();
        let outcome = mapper
            .map(process.as_ref(), payload_path, ManualMapFlags::STEALTH)
            .unwrap();
        assert_ne!(outcome.base_address, 0);
    }
}

syringe_test! {
    fn unmap_after_map_succeeds(
        process: Process,
        payload_path: &Path,
    ) {
        let mapper = ManualMapper::default();
        let outcome = mapper
            .map(process.as_ref(), payload_path, ManualMapFlags::default())
            .unwrap();
        mapper.unmap(process.as_ref(), outcome.base_address).unwrap();
    }
}

syringe_test! {
    fn map_with_invalid_path_fails(
        process: Process,
        _payload_path: &Path,
    ) {
        let mapper = ManualMapper::default();
        let result = mapper.map(process.as_ref(), std::path::Path::new("invalid path"), ManualMapFlags::default());
        assert!(result.is_err());
    }
}
