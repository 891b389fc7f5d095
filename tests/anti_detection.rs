use dll_syringe::{AntiDetectTechnique, AntiDetection, ManualMapFlags, ManualMapper};

#[allow(unused)]
mod common;

syringe_test! {
    fn unlink_from_peb_hides_module_from_loader_list(
        process: Process,
        payload_path: &Path,
    ) {
        let mapper = ManualMapper::default();
        let outcome = mapper
            .map(process.as_ref(), payload_path, ManualMapFlags::default())
            .unwrap();

        let anti_detect = AntiDetection::default();
        assert!(!anti_detect.is_module_hidden(process.as_ref(), outcome.base_address).unwrap());

        anti_detect.unlink_from_peb(process.as_ref(), outcome.base_address).unwrap();
        assert!(anti_detect.is_module_hidden(process.as_ref(), outcome.base_address).unwrap());
    }
}

syringe_test! {
    fn erase_headers_does_not_error_on_a_freshly_mapped_module(
        process: Process,
        payload_path: &Path,
    ) {
        let mapper = ManualMapper::default();
        let outcome = mapper
            .map(process.as_ref(), payload_path, ManualMapFlags::default())
            .unwrap();

        let anti_detect = AntiDetection::default();
        anti_detect.erase_headers(process.as_ref(), outcome.base_address).unwrap();
    }
}

syringe_test! {
    fn apply_with_basic_techniques_unlinks_and_erases(
        process: Process,
        payload_path: &Path,
    ) {
        let mapper = ManualMapper::default();
        let outcome = mapper
            .map(process.as_ref(), payload_path, ManualMapFlags::default())
            .unwrap();

        let anti_detect = AntiDetection::default();
        anti_detect
            .apply(process.as_ref(), outcome.base_address, AntiDetectTechnique::BASIC)
            .unwrap();
        assert!(anti_detect.is_module_hidden(process.as_ref(), outcome.base_address).unwrap());
    }
}

syringe_test! {
    fn apply_with_empty_techniques_is_a_harmless_no_op(
        process: Process,
        payload_path: &Path,
    ) {
        let mapper = ManualMapper::default();
        let outcome = mapper
            .map(process.as_ref(), payload_path, ManualMapFlags::default())
            .unwrap();

        let anti_detect = AntiDetection::default();
        anti_detect
            .apply(process.as_ref(), outcome.base_address, AntiDetectTechnique::empty())
            .unwrap();
        assert!(!anti_detect.is_module_hidden(process.as_ref(), outcome.base_address).unwrap());
    }
}
