//! C11: named bundles of injection intent, persisted as a JSON object keyed by opaque ids.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{anti_detection::AntiDetectTechnique, error::SyringeError, strategies::StrategyKind, utils::fold_name};

fn default_method() -> StrategyKind {
    StrategyKind::ClassicThread
}

fn default_wait_timeout_ms() -> u32 {
    30_000
}

fn default_max_retries() -> i32 {
    3
}

fn default_retry_delay_ms() -> u32 {
    1_000
}

mod method_as_code {
    use super::StrategyKind;
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &StrategyKind, serializer: S) -> Result<S::Ok, S::Error> {
        value.to_method_code().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StrategyKind, D::Error> {
        let code = u8::deserialize(deserializer)?;
        StrategyKind::from_method_code(code)
            .ok_or_else(|| D::Error::custom(format!("invalid method code: {code}")))
    }
}

mod anti_detect_as_bits {
    use super::AntiDetectTechnique;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &AntiDetectTechnique,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value.bits().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<AntiDetectTechnique, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Ok(AntiDetectTechnique::from_bits_truncate(bits))
    }
}

/// A persisted bundle documenting user intent for one injection: a target process pattern, a
/// DLL, a strategy, and the policy around waiting, retrying and auto-injecting.
///
/// Field names mirror the on-disk JSON schema verbatim (see `SPEC_FULL.md` §6); the Rust field
/// names are the `snake_case` counterparts, reconciled via `#[serde(rename = "...")]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionProfile {
    /// A short user-facing label.
    #[serde(default)]
    pub name: String,
    /// A longer free-text description.
    #[serde(default)]
    pub description: String,
    /// The target process name or pattern this profile is for.
    #[serde(rename = "targetProcess", default)]
    pub target_process: String,
    /// Path to the DLL to inject.
    #[serde(rename = "dllPath", default)]
    pub dll_path: String,
    /// Which strategy to use, stored on disk as the integer code from
    /// [`StrategyKind::to_method_code`].
    #[serde(with = "method_as_code", default = "default_method")]
    pub method: StrategyKind,
    /// Whether to wait for the target process to appear before injecting.
    #[serde(rename = "waitForProcess", default)]
    pub wait_for_process: bool,
    /// How long to wait for the target process, in milliseconds.
    #[serde(rename = "waitTimeout", default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u32,
    /// Delay before injecting once the target process is found, in milliseconds.
    #[serde(rename = "injectionDelay", default)]
    pub inject_delay_ms: u32,
    /// Anti-detection passes to run after injection, stored on disk as a bitmask integer.
    #[serde(rename = "antiDetect", with = "anti_detect_as_bits", default)]
    pub anti_detect: AntiDetectTechnique,
    /// Whether this profile should be picked up by the auto-injector.
    #[serde(rename = "autoInject", default)]
    pub auto_inject: bool,
    /// Whether to inject immediately when the application embedding this crate starts.
    #[serde(rename = "injectOnStartup", default)]
    pub inject_on_startup: bool,
    /// Whether to keep retrying on failure, up to `max_retries`.
    #[serde(rename = "keepTrying", default)]
    pub keep_trying: bool,
    /// Maximum number of retries when `keep_trying` is set.
    #[serde(rename = "maxRetries", default = "default_max_retries")]
    pub max_retries: i32,
    /// Delay between retries, in milliseconds.
    #[serde(rename = "retryDelay", default = "default_retry_delay_ms")]
    pub retry_delay_ms: u32,
    /// Whether this profile requires the caller to be running elevated.
    #[serde(rename = "requireAdmin", default)]
    pub require_admin: bool,
    /// Restricts this profile to 64-bit targets only.
    #[serde(rename = "x64Only", default)]
    pub x64_only: bool,
    /// Restricts this profile to 32-bit targets only.
    #[serde(rename = "x86Only", default)]
    pub x86_only: bool,
}

impl Default for InjectionProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            target_process: String::new(),
            dll_path: String::new(),
            method: default_method(),
            wait_for_process: false,
            wait_timeout_ms: default_wait_timeout_ms(),
            inject_delay_ms: 0,
            anti_detect: AntiDetectTechnique::empty(),
            auto_inject: false,
            inject_on_startup: false,
            keep_trying: false,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            require_admin: false,
            x64_only: false,
            x86_only: false,
        }
    }
}

/// A mutex-guarded, JSON-backed collection of [`InjectionProfile`]s keyed by an opaque id.
///
/// The ported system assumed single-threaded UI-thread access to its in-memory map; this crate
/// keeps a single mutex around the whole map instead, so the store is safely `Sync` without
/// depending on an external synchronisation contract (see `SPEC_FULL.md` §4.C11).
#[derive(Debug)]
pub struct ProfileStore {
    path: Mutex<PathBuf>,
    profiles: Mutex<HashMap<String, InjectionProfile>>,
}

impl Default for ProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileStore {
    /// Creates an empty store pointed at the default path. Call [`Self::load`] to populate it
    /// from disk.
    pub fn new() -> Self {
        Self::with_path(Self::default_path())
    }

    /// Creates an empty store pointed at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Mutex::new(path.into()),
            profiles: Mutex::new(HashMap::new()),
        }
    }

    /// `%APPDATA%/dll-syringe/profiles.json` (renamed from the ported system's product-specific
    /// folder name; see `DESIGN.md`).
    pub fn default_path() -> PathBuf {
        let base = std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("dll-syringe").join("profiles.json")
    }

    /// Reads the store's path, replacing the in-memory profile map. A missing file is treated as
    /// an empty store rather than an error, matching the ported system.
    pub fn load(&self) -> Result<(), SyringeError> {
        let path = self.path.lock().unwrap().clone();
        if !path.is_file() {
            return Ok(());
        }
        let contents = fs::read_to_string(&path)?;
        let loaded: HashMap<String, InjectionProfile> = serde_json::from_str(&contents)
            .map_err(|err| SyringeError::InvalidArgument(format!("malformed profile store: {err}")))?;
        *self.profiles.lock().unwrap() = loaded;
        Ok(())
    }

    /// Writes the in-memory profile map to the store's path, creating parent directories as
    /// needed.
    pub fn save(&self) -> Result<(), SyringeError> {
        let path = self.path.lock().unwrap().clone();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = {
            let profiles = self.profiles.lock().unwrap();
            serde_json::to_string_pretty(&*profiles)
                .map_err(|err| SyringeError::InvalidArgument(format!("failed to serialize profile store: {err}")))?
        };
        fs::write(&path, json)?;
        Ok(())
    }

    /// Adds a profile under a freshly generated id, returning the id.
    pub fn add(&self, profile: InjectionProfile) -> String {
        let id = generate_id();
        self.profiles.lock().unwrap().insert(id.clone(), profile);
        id
    }

    /// Removes a profile by id; `true` if one was present.
    pub fn remove(&self, id: &str) -> bool {
        self.profiles.lock().unwrap().remove(id).is_some()
    }

    /// Looks up a profile by id.
    pub fn get(&self, id: &str) -> Option<InjectionProfile> {
        self.profiles.lock().unwrap().get(id).cloned()
    }

    /// Looks up the first profile whose `name` matches exactly.
    pub fn get_by_name(&self, name: &str) -> Option<(String, InjectionProfile)> {
        self.profiles
            .lock()
            .unwrap()
            .iter()
            .find(|(_, profile)| profile.name == name)
            .map(|(id, profile)| (id.clone(), profile.clone()))
    }

    /// Every `(id, profile)` pair currently in the store.
    pub fn all(&self) -> Vec<(String, InjectionProfile)> {
        self.profiles
            .lock()
            .unwrap()
            .iter()
            .map(|(id, profile)| (id.clone(), profile.clone()))
            .collect()
    }

    /// Profiles whose `target_process` matches `process_name`.
    ///
    /// Preserves the ported system's matching rule verbatim: an exact (folded) match, OR the
    /// process name containing the profile's target pattern as a substring, OR the target
    /// pattern itself containing a literal `*` (treated as "matches anything" without actual
    /// globbing — the ported system never implements real wildcard matching either).
    pub fn profiles_for_process(&self, process_name: &str) -> Vec<(String, InjectionProfile)> {
        let folded_name = fold_name(process_name);
        self.profiles
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, profile)| {
                let target = fold_name(&profile.target_process);
                target == folded_name || folded_name.contains(&target) || target.contains('*')
            })
            .map(|(id, profile)| (id.clone(), profile.clone()))
            .collect()
    }

    /// Profiles with `auto_inject` set.
    pub fn auto_inject_profiles(&self) -> Vec<(String, InjectionProfile)> {
        self.profiles
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, profile)| profile.auto_inject)
            .map(|(id, profile)| (id.clone(), profile.clone()))
            .collect()
    }

    /// Replaces the profile at `id` entirely; `true` if one was present.
    pub fn update(&self, id: &str, profile: InjectionProfile) -> bool {
        match self.profiles.lock().unwrap().get_mut(id) {
            Some(slot) => {
                *slot = profile;
                true
            }
            None => false,
        }
    }

    /// Writes a single profile's JSON to `path`, independent of the store's own file.
    pub fn export_profile(&self, id: &str, path: impl AsRef<Path>) -> Result<(), SyringeError> {
        let profile = self
            .get(id)
            .ok_or_else(|| SyringeError::InvalidArgument(format!("no such profile: {id}")))?;
        let json = serde_json::to_string_pretty(&profile)
            .map_err(|err| SyringeError::InvalidArgument(format!("failed to serialize profile: {err}")))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Reads a single profile's JSON from `path` and adds it under a freshly generated id.
    pub fn import_profile(&self, path: impl AsRef<Path>) -> Result<String, SyringeError> {
        let contents = fs::read_to_string(path)?;
        let profile: InjectionProfile = serde_json::from_str(&contents)
            .map_err(|err| SyringeError::InvalidArgument(format!("malformed profile: {err}")))?;
        Ok(self.add(profile))
    }
}

/// An 8-hex-digit random id, matching the ported system's `GenerateId` (a `mt19937`-backed
/// 4-bit-per-digit generator) in shape if not in PRNG choice.
fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).expect("0..16 is a valid hex digit"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_matches_upstream_defaults() {
        let profile = InjectionProfile::default();
        assert_eq!(profile.method, StrategyKind::ClassicThread);
        assert_eq!(profile.wait_timeout_ms, 30_000);
        assert_eq!(profile.max_retries, 3);
        assert_eq!(profile.retry_delay_ms, 1_000);
        assert_eq!(profile.anti_detect, AntiDetectTechnique::empty());
    }

    #[test]
    fn profile_round_trips_through_json_with_verbatim_field_names() {
        let mut profile = InjectionProfile {
            name: "test".into(),
            target_process: "notepad.exe".into(),
            dll_path: "C:\\payload.dll".into(),
            method: StrategyKind::ManualMap,
            anti_detect: AntiDetectTechnique::BASIC,
            auto_inject: true,
            max_retries: 5,
            ..InjectionProfile::default()
        };
        profile.description = "a profile".into();

        let json = serde_json::to_string(&profile).unwrap();
        assert!(json.contains("\"targetProcess\""));
        assert!(json.contains("\"dllPath\""));
        assert!(json.contains("\"maxRetries\""));
        assert!(!json.contains("\"target_process\""));

        let round_tripped: InjectionProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(round_tripped, profile);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults_on_deserialize() {
        let profile: InjectionProfile = serde_json::from_str("{}").unwrap();
        assert_eq!(profile, InjectionProfile::default());
    }

    #[test]
    fn store_add_get_remove_round_trip() {
        let store = ProfileStore::with_path(std::env::temp_dir().join("does-not-exist.json"));
        let id = store.add(InjectionProfile {
            name: "demo".into(),
            ..InjectionProfile::default()
        });
        assert_eq!(store.get(&id).unwrap().name, "demo");
        assert!(store.remove(&id));
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn profiles_for_process_matches_exact_substring_and_wildcard() {
        let store = ProfileStore::with_path(std::env::temp_dir().join("does-not-exist-2.json"));
        let exact = store.add(InjectionProfile {
            target_process: "Notepad.exe".into(),
            ..InjectionProfile::default()
        });
        let wildcard = store.add(InjectionProfile {
            target_process: "*".into(),
            ..InjectionProfile::default()
        });

        let matches = store.profiles_for_process("notepad.exe");
        let ids: Vec<_> = matches.iter().map(|(id, _)| id.clone()).collect();
        assert!(ids.contains(&exact));
        assert!(ids.contains(&wildcard));

        let unrelated = store.profiles_for_process("calc.exe");
        let unrelated_ids: Vec<_> = unrelated.iter().map(|(id, _)| id.clone()).collect();
        assert!(!unrelated_ids.contains(&exact));
        assert!(unrelated_ids.contains(&wildcard));
    }

    #[test]
    fn auto_inject_profiles_filters_on_flag() {
        let store = ProfileStore::with_path(std::env::temp_dir().join("does-not-exist-3.json"));
        store.add(InjectionProfile::default());
        let auto = store.add(InjectionProfile {
            auto_inject: true,
            ..InjectionProfile::default()
        });

        let autos = store.auto_inject_profiles();
        assert_eq!(autos.len(), 1);
        assert_eq!(autos[0].0, auto);
    }

    #[test]
    fn generated_ids_are_eight_hex_digits() {
        let id = generate_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
