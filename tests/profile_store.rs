use dll_syringe::{AntiDetectTechnique, InjectionProfile, ProfileStore};

#[test]
fn save_and_load_round_trips_through_disk() {
    let dir = std::env::temp_dir().join(format!("dll-syringe-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("profiles.json");

    let store = ProfileStore::with_path(&path);
    let id = store.add(InjectionProfile {
        name: "notepad profile".into(),
        target_process: "notepad.exe".into(),
        dll_path: "C:\\payload.dll".into(),
        anti_detect: AntiDetectTechnique::ADVANCED,
        auto_inject: true,
        ..InjectionProfile::default()
    });
    store.save().unwrap();

    let reloaded = ProfileStore::with_path(&path);
    reloaded.load().unwrap();
    let profile = reloaded.get(&id).unwrap();
    assert_eq!(profile.name, "notepad profile");
    assert_eq!(profile.anti_detect, AntiDetectTechnique::ADVANCED);
    assert!(profile.auto_inject);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn load_of_a_missing_file_leaves_the_store_empty() {
    let path = std::env::temp_dir().join("dll-syringe-test-definitely-missing.json");
    let _ = std::fs::remove_file(&path);

    let store = ProfileStore::with_path(&path);
    store.load().unwrap();
    assert!(store.all().is_empty());
}

#[test]
fn export_then_import_produces_an_equivalent_profile_under_a_new_id() {
    let dir = std::env::temp_dir().join(format!("dll-syringe-test-export-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let export_path = dir.join("exported.json");

    let store = ProfileStore::with_path(dir.join("profiles.json"));
    let original_id = store.add(InjectionProfile {
        name: "exported".into(),
        target_process: "calc.exe".into(),
        ..InjectionProfile::default()
    });
    store.export_profile(&original_id, &export_path).unwrap();

    let imported_id = store.import_profile(&export_path).unwrap();
    assert_ne!(imported_id, original_id);
    assert_eq!(store.get(&imported_id).unwrap().name, "exported");

    std::fs::remove_dir_all(&dir).unwrap();
}
