//! JSON persistence for profiles, chains, subscriptions, routing data and
//! scalar settings. Every category is one document, rewritten whole through
//! an atomic temp-file-then-rename; scalar settings live one value per file.
//! Referential integrity across documents is checked lazily at load time,
//! never maintained continuously.

use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{BuildOptions, InboundSettings};
use crate::error::{Error, Result};
use crate::model::{
    default_dns_config, now_unix, Chain, ConnectionMode, DnsEntry, Profile, RoutingRules,
    RoutingToggles, ServerConfig, Subscription,
};
use crate::validate::{self, ProfileResolver};
use crate::link;

const PROFILES_FILE: &str = "profiles.json";
const CHAINS_FILE: &str = "chains.json";
const SUBSCRIPTIONS_FILE: &str = "subscriptions.json";
const DNS_CONFIG_FILE: &str = "dns_config.json";
const ROUTING_RULES_FILE: &str = "routing_rules.json";
const ROUTING_TOGGLES_FILE: &str = "routing_toggles.json";
const RECENT_FILES_FILE: &str = "recent_files.json";
const SETTINGS_DIR: &str = "settings";

const MAX_RECENT_FILES: usize = 10;
const DEFAULT_PROXY_PORT: u16 = 2080;
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RecentFiles {
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    last_selected: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    /// Opens the per-user store under the platform config directory.
    pub fn new() -> Result<Self> {
        let base = dirs::config_dir().ok_or(Error::NotFound("config directory"))?;
        Self::with_dir(base.join("xenray"))
    }

    /// Opens a store rooted at an explicit directory.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(dir.join(SETTINGS_DIR))?;
        Ok(ConfigStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_doc<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        let path = self.dir.join(name);
        if !path.exists() {
            return T::default();
        }
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(document = name, %err, "discarding unreadable document");
                T::default()
            }),
            Err(err) => {
                warn!(document = name, %err, "failed to read document");
                T::default()
            }
        }
    }

    fn write_doc<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let content = serde_json::to_string_pretty(value)?;
        atomic_write(&path, content.as_bytes())
    }

    // ----- profiles -----

    pub fn list_profiles(&self) -> Vec<Profile> {
        self.read_doc(PROFILES_FILE)
    }

    pub fn get_profile(&self, id: &str) -> Option<Profile> {
        self.list_profiles().into_iter().find(|p| p.id == id)
    }

    /// Saves a profile, assigning an id and creation timestamp when absent.
    /// An existing profile with the same id is replaced.
    pub fn save_profile(&self, mut profile: Profile) -> Result<Profile> {
        validate::profile_name(&profile.name)?;
        validate::profile_config(&profile.config)?;
        if profile.id.trim().is_empty() {
            profile.id = Uuid::new_v4().to_string();
        }
        if profile.created_at == 0 {
            profile.created_at = now_unix();
        }

        let mut profiles = self.list_profiles();
        match profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(slot) => *slot = profile.clone(),
            None => profiles.push(profile.clone()),
        }
        self.write_doc(PROFILES_FILE, &profiles)?;
        Ok(profile)
    }

    /// Partial update with merge semantics: patch fields overlay the stored
    /// profile, objects merging key-wise. Id and creation time are immutable.
    pub fn update_profile(&self, id: &str, patch: &Value) -> Result<Profile> {
        let profile = self
            .get_profile(id)
            .ok_or(Error::NotFound("profile"))?;
        let mut merged = serde_json::to_value(&profile)?;
        merge_value(&mut merged, patch);
        let mut updated: Profile = serde_json::from_value(merged)?;
        updated.id = profile.id;
        updated.created_at = profile.created_at;
        self.save_profile(updated)
    }

    pub fn delete_profile(&self, id: &str) -> Result<bool> {
        let mut profiles = self.list_profiles();
        let before = profiles.len();
        profiles.retain(|p| p.id != id);
        if profiles.len() == before {
            return Ok(false);
        }
        self.write_doc(PROFILES_FILE, &profiles)?;
        Ok(true)
    }

    // ----- chains -----

    pub fn list_chains(&self) -> Vec<Chain> {
        self.read_doc(CHAINS_FILE)
    }

    pub fn get_chain(&self, id: &str) -> Option<Chain> {
        self.list_chains().into_iter().find(|c| c.id == id)
    }

    pub fn save_chain(&self, mut chain: Chain) -> Result<Chain> {
        validate::profile_name(&chain.name)?;
        let chain_ids: Vec<String> = self.list_chains().into_iter().map(|c| c.id).collect();
        validate::chain_items(&chain.items, |id| chain_ids.iter().any(|c| c == id), self)?;
        if chain.id.trim().is_empty() {
            chain.id = Uuid::new_v4().to_string();
        }
        if chain.created_at == 0 {
            chain.created_at = now_unix();
        }

        let mut chains = self.list_chains();
        match chains.iter_mut().find(|c| c.id == chain.id) {
            Some(slot) => *slot = chain.clone(),
            None => chains.push(chain.clone()),
        }
        self.write_doc(CHAINS_FILE, &chains)?;
        Ok(chain)
    }

    pub fn delete_chain(&self, id: &str) -> Result<bool> {
        let mut chains = self.list_chains();
        let before = chains.len();
        chains.retain(|c| c.id != id);
        if chains.len() == before {
            return Ok(false);
        }
        self.write_doc(CHAINS_FILE, &chains)?;
        Ok(true)
    }

    /// Enriched view of a chain: items resolved against the live profile
    /// set. Dangling references surface here as `None`, not at write time.
    pub fn chain_profiles(&self, chain: &Chain) -> Vec<(String, Option<Profile>)> {
        chain
            .items
            .iter()
            .map(|id| (id.clone(), self.get_profile(id)))
            .collect()
    }

    // ----- subscriptions -----

    pub fn list_subscriptions(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self.read_doc(SUBSCRIPTIONS_FILE);
        // Embedded entries gain an id lazily on load; written back so the
        // ids stay stable across loads.
        let mut assigned = false;
        for sub in &mut subs {
            for profile in &mut sub.profiles {
                if profile.id.trim().is_empty() {
                    profile.id = Uuid::new_v4().to_string();
                    assigned = true;
                }
            }
        }
        if assigned {
            if let Err(err) = self.write_doc(SUBSCRIPTIONS_FILE, &subs) {
                warn!(%err, "failed to persist assigned subscription profile ids");
            }
        }
        subs
    }

    pub fn get_subscription(&self, id: &str) -> Option<Subscription> {
        self.list_subscriptions().into_iter().find(|s| s.id == id)
    }

    pub fn save_subscription(&self, mut sub: Subscription) -> Result<Subscription> {
        validate::profile_name(&sub.name)?;
        if sub.url.trim().is_empty() {
            return Err(Error::validation("subscription url must not be empty"));
        }
        if sub.id.trim().is_empty() {
            sub.id = Uuid::new_v4().to_string();
        }
        if sub.created_at == 0 {
            sub.created_at = now_unix();
        }

        let mut subs = self.list_subscriptions();
        match subs.iter_mut().find(|s| s.id == sub.id) {
            Some(slot) => *slot = sub.clone(),
            None => subs.push(sub.clone()),
        }
        self.write_doc(SUBSCRIPTIONS_FILE, &subs)?;
        Ok(sub)
    }

    pub fn delete_subscription(&self, id: &str) -> Result<bool> {
        let mut subs = self.list_subscriptions();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() == before {
            return Ok(false);
        }
        self.write_doc(SUBSCRIPTIONS_FILE, &subs)?;
        Ok(true)
    }

    /// Replaces a subscription's embedded profiles with the parsed contents
    /// of a fetched body. Returns the number imported and per-line errors.
    pub fn apply_subscription_update(&self, id: &str, body: &str) -> Result<(usize, Vec<String>)> {
        let mut sub = self
            .get_subscription(id)
            .ok_or(Error::NotFound("subscription"))?;
        let (mut profiles, errors) = link::parse_list(body);
        for profile in &mut profiles {
            profile.id = Uuid::new_v4().to_string();
        }
        let added = profiles.len();
        sub.profiles = profiles;
        self.save_subscription(sub)?;
        Ok((added, errors))
    }

    /// Fetches the subscription url and applies the body.
    pub fn fetch_subscription(&self, id: &str) -> Result<(usize, Vec<String>)> {
        let sub = self
            .get_subscription(id)
            .ok_or(Error::NotFound("subscription"))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        let body = client
            .get(&sub.url)
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.text())
            .map_err(|e| Error::Fetch(e.to_string()))?;
        self.apply_subscription_update(id, &body)
    }

    // ----- routing / dns -----

    pub fn routing_rules(&self) -> RoutingRules {
        self.read_doc(ROUTING_RULES_FILE)
    }

    pub fn set_routing_rules(&self, mut rules: RoutingRules) -> Result<()> {
        for bucket in [&mut rules.direct, &mut rules.proxy, &mut rules.block] {
            dedup_preserving_order(bucket);
        }
        self.write_doc(ROUTING_RULES_FILE, &rules)
    }

    pub fn routing_toggles(&self) -> RoutingToggles {
        self.read_doc(ROUTING_TOGGLES_FILE)
    }

    pub fn set_routing_toggles(&self, toggles: &RoutingToggles) -> Result<()> {
        self.write_doc(ROUTING_TOGGLES_FILE, toggles)
    }

    pub fn dns_config(&self) -> Vec<DnsEntry> {
        let entries: Vec<DnsEntry> = self.read_doc(DNS_CONFIG_FILE);
        if entries.is_empty() {
            default_dns_config()
        } else {
            entries
        }
    }

    pub fn set_dns_config(&self, entries: &[DnsEntry]) -> Result<()> {
        self.write_doc(DNS_CONFIG_FILE, &entries.to_vec())
    }

    // ----- recent files -----

    pub fn recent_files(&self) -> Vec<String> {
        let recent: RecentFiles = self.read_doc(RECENT_FILES_FILE);
        recent
            .files
            .into_iter()
            .filter(|p| validate_recent_path(p).is_ok())
            .collect()
    }

    pub fn add_recent_file(&self, path: &str) -> Result<()> {
        validate_recent_path(path)?;
        let mut recent: RecentFiles = self.read_doc(RECENT_FILES_FILE);
        recent.files.retain(|p| p != path);
        recent.files.insert(0, path.to_string());
        recent.files.truncate(MAX_RECENT_FILES);
        self.write_doc(RECENT_FILES_FILE, &recent)
    }

    pub fn last_selected_path(&self) -> Option<String> {
        let recent: RecentFiles = self.read_doc(RECENT_FILES_FILE);
        recent
            .last_selected
            .filter(|p| validate_recent_path(p).is_ok())
    }

    pub fn set_last_selected_path(&self, path: &str) -> Result<()> {
        validate_recent_path(path)?;
        let mut recent: RecentFiles = self.read_doc(RECENT_FILES_FILE);
        recent.last_selected = Some(path.to_string());
        self.write_doc(RECENT_FILES_FILE, &recent)
    }

    // ----- scalar settings -----

    fn read_setting(&self, key: &str) -> Option<String> {
        let path = self.dir.join(SETTINGS_DIR).join(key);
        std::fs::read_to_string(path)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn write_setting(&self, key: &str, value: &str) -> Result<()> {
        let path = self.dir.join(SETTINGS_DIR).join(key);
        atomic_write(&path, value.as_bytes())
    }

    pub fn proxy_port(&self) -> u16 {
        self.read_setting("proxy_port")
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|v| validate::port(v).ok())
            .unwrap_or(DEFAULT_PROXY_PORT)
    }

    pub fn set_proxy_port(&self, port: i64) -> Result<()> {
        let port = validate::port(port)?;
        self.write_setting("proxy_port", &port.to_string())
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        self.read_setting("connection_mode")
            .and_then(|v| ConnectionMode::parse(&v))
            .unwrap_or_default()
    }

    pub fn set_connection_mode(&self, mode: ConnectionMode) -> Result<()> {
        self.write_setting("connection_mode", mode.as_str())
    }

    pub fn theme(&self) -> String {
        self.read_setting("theme")
            .filter(|v| ["light", "dark", "system"].contains(&v.as_str()))
            .unwrap_or_else(|| "system".to_string())
    }

    pub fn set_theme(&self, theme: &str) -> Result<()> {
        if !["light", "dark", "system"].contains(&theme) {
            return Err(Error::validation(format!("unknown theme: {theme}")));
        }
        self.write_setting("theme", theme)
    }

    pub fn language(&self) -> String {
        self.read_setting("language")
            .filter(|v| v.len() <= 8 && v.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
            .unwrap_or_else(|| "en".to_string())
    }

    pub fn set_language(&self, language: &str) -> Result<()> {
        if language.is_empty()
            || language.len() > 8
            || !language.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::validation(format!("invalid language tag: {language}")));
        }
        self.write_setting("language", language)
    }

    pub fn sort_mode(&self) -> String {
        self.read_setting("sort_mode")
            .filter(|v| ["name", "latency", "created"].contains(&v.as_str()))
            .unwrap_or_else(|| "name".to_string())
    }

    pub fn set_sort_mode(&self, mode: &str) -> Result<()> {
        if !["name", "latency", "created"].contains(&mode) {
            return Err(Error::validation(format!("unknown sort mode: {mode}")));
        }
        self.write_setting("sort_mode", mode)
    }

    pub fn routing_country(&self) -> Option<String> {
        self.read_setting("routing_country")
    }

    pub fn set_routing_country(&self, country: &str) -> Result<()> {
        self.write_setting("routing_country", country)
    }

    pub fn custom_dns(&self) -> String {
        self.read_setting("custom_dns").unwrap_or_default()
    }

    pub fn set_custom_dns(&self, value: &str) -> Result<()> {
        self.write_setting("custom_dns", value)
    }

    pub fn remember_close_choice(&self) -> bool {
        self.read_bool("remember_close", false)
    }

    pub fn set_remember_close_choice(&self, value: bool) -> Result<()> {
        self.write_setting("remember_close", bool_str(value))
    }

    pub fn startup_enabled(&self) -> bool {
        self.read_bool("startup_enabled", false)
    }

    pub fn set_startup_enabled(&self, value: bool) -> Result<()> {
        self.write_setting("startup_enabled", bool_str(value))
    }

    pub fn auto_reconnect_enabled(&self) -> bool {
        self.read_bool("auto_reconnect", true)
    }

    pub fn set_auto_reconnect_enabled(&self, value: bool) -> Result<()> {
        self.write_setting("auto_reconnect", bool_str(value))
    }

    pub fn last_selected_profile(&self) -> Option<String> {
        self.read_setting("last_selected_profile")
    }

    pub fn set_last_selected_profile(&self, id: &str) -> Result<()> {
        if self.get_profile(id).is_none() {
            return Err(Error::NotFound("profile"));
        }
        self.write_setting("last_selected_profile", id)
    }

    fn read_bool(&self, key: &str, default: bool) -> bool {
        match self.read_setting(key).as_deref() {
            Some("true") => true,
            Some("false") => false,
            _ => default,
        }
    }

    // ----- derived views -----

    /// The server definition the supervisor should launch when the caller
    /// passes none: selected outbound of the last-selected profile.
    pub fn active_server(&self) -> Option<ServerConfig> {
        let id = self.last_selected_profile()?;
        let profile = self.get_profile(&id)?;
        profile.config.selected_outbound().cloned()
    }

    pub fn inbound_settings(&self) -> InboundSettings {
        InboundSettings {
            port: self.proxy_port(),
            ..InboundSettings::default()
        }
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            rules: self.routing_rules(),
            toggles: self.routing_toggles(),
            dns: self.dns_config(),
        }
    }
}

impl ProfileResolver for ConfigStore {
    fn resolve_for_validation(&self, id: &str) -> Option<Profile> {
        self.get_profile(id)
    }
}

/// Write-to-temp-then-rename in the target directory, so a crash mid-write
/// never leaves a truncated document behind.
fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or(Error::NotFound("parent directory"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    debug!(path = %path.display(), "document written");
    Ok(())
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn merge_value(dest: &mut Value, patch: &Value) {
    match (dest, patch) {
        (Value::Object(dest), Value::Object(patch)) => {
            for (key, value) in patch {
                merge_value(dest.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (dest, patch) => *dest = patch.clone(),
    }
}

fn dedup_preserving_order(values: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    values.retain(|v| seen.insert(v.clone()));
}

/// Traversal guard applied to every recent-files read and write. Rejects
/// parent-directory components and paths rooted at a separator.
fn validate_recent_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(Error::validation("path must not be empty"));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(Error::validation(format!("path must be relative: {path}")));
    }
    if Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::validation(format!("path escapes its directory: {path}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProfileConfig;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::with_dir(dir.path()).unwrap();
        (dir, store)
    }

    fn profile(name: &str) -> Profile {
        Profile {
            id: String::new(),
            name: name.to_string(),
            config: ProfileConfig {
                outbounds: vec![ServerConfig::new("vless", "a.example.com", 443)],
                ..ProfileConfig::default()
            },
            created_at: 0,
        }
    }

    #[test]
    fn save_assigns_id_and_timestamp() {
        let (_dir, store) = store();
        let saved = store.save_profile(profile("one")).unwrap();
        assert!(!saved.id.is_empty());
        assert!(saved.created_at > 0);
        assert_eq!(store.get_profile(&saved.id).unwrap().name, "one");
    }

    #[test]
    fn save_rejects_empty_name_and_config() {
        let (_dir, store) = store();
        let mut bad = profile(" ");
        assert!(store.save_profile(bad.clone()).is_err());
        bad.name = "ok".to_string();
        bad.config.outbounds.clear();
        assert!(store.save_profile(bad).is_err());
    }

    #[test]
    fn update_merges_and_keeps_identity() {
        let (_dir, store) = store();
        let saved = store.save_profile(profile("one")).unwrap();
        let updated = store
            .update_profile(
                &saved.id,
                &json!({
                    "name": "renamed",
                    "config": { "outbounds": [{ "protocol": "vless", "address": "b.example.com", "port": 8443 }] }
                }),
            )
            .unwrap();
        assert_eq!(updated.id, saved.id);
        assert_eq!(updated.created_at, saved.created_at);
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.config.outbounds[0].address, "b.example.com");
    }

    #[test]
    fn delete_reports_missing() {
        let (_dir, store) = store();
        let saved = store.save_profile(profile("one")).unwrap();
        assert!(store.delete_profile(&saved.id).unwrap());
        assert!(!store.delete_profile(&saved.id).unwrap());
    }

    #[test]
    fn chain_save_validates_against_live_profiles() {
        let (_dir, store) = store();
        let a = store.save_profile(profile("a")).unwrap();
        let b = store.save_profile(profile("b")).unwrap();

        let chain = Chain {
            id: String::new(),
            name: "route".to_string(),
            items: vec![a.id.clone(), b.id.clone()],
            created_at: 0,
        };
        let saved = store.save_chain(chain).unwrap();
        assert!(!saved.id.is_empty());

        let dangling = Chain {
            id: String::new(),
            name: "bad".to_string(),
            items: vec![a.id, "missing".to_string()],
            created_at: 0,
        };
        assert!(store.save_chain(dangling).is_err());
    }

    #[test]
    fn chain_enrichment_reports_dangling_items() {
        let (_dir, store) = store();
        let a = store.save_profile(profile("a")).unwrap();
        let b = store.save_profile(profile("b")).unwrap();
        let chain = store
            .save_chain(Chain {
                id: String::new(),
                name: "route".to_string(),
                items: vec![a.id.clone(), b.id.clone()],
                created_at: 0,
            })
            .unwrap();

        store.delete_profile(&b.id).unwrap();
        let resolved = store.chain_profiles(&store.get_chain(&chain.id).unwrap());
        assert!(resolved[0].1.is_some());
        assert!(resolved[1].1.is_none());
    }

    #[test]
    fn settings_fall_back_on_invalid_values() {
        let (_dir, store) = store();
        store.write_setting("proxy_port", "80").unwrap();
        assert_eq!(store.proxy_port(), DEFAULT_PROXY_PORT);
        store.write_setting("proxy_port", "garbage").unwrap();
        assert_eq!(store.proxy_port(), DEFAULT_PROXY_PORT);
        store.set_proxy_port(4080).unwrap();
        assert_eq!(store.proxy_port(), 4080);
        assert!(store.set_proxy_port(80).is_err());

        store.write_setting("theme", "neon").unwrap();
        assert_eq!(store.theme(), "system");
        store.set_theme("dark").unwrap();
        assert_eq!(store.theme(), "dark");

        store.write_setting("connection_mode", "tunnel").unwrap();
        assert_eq!(store.connection_mode(), ConnectionMode::Proxy);
        store.set_connection_mode(ConnectionMode::Vpn).unwrap();
        assert_eq!(store.connection_mode(), ConnectionMode::Vpn);
    }

    #[test]
    fn last_selected_profile_must_exist() {
        let (_dir, store) = store();
        assert!(store.set_last_selected_profile("missing").is_err());
        let saved = store.save_profile(profile("one")).unwrap();
        store.set_last_selected_profile(&saved.id).unwrap();
        assert_eq!(store.active_server().unwrap().address, "a.example.com");
    }

    #[test]
    fn recent_files_reject_absolute_and_traversal_paths() {
        let (_dir, store) = store();
        assert!(store.add_recent_file("/etc/passwd").is_err());
        assert!(store.add_recent_file("\\windows\\system32").is_err());
        assert!(store.add_recent_file("configs/../../secret.json").is_err());
        store.add_recent_file("configs/home.json").unwrap();
        assert_eq!(store.recent_files(), vec!["configs/home.json"]);
    }

    #[test]
    fn recent_files_are_bounded_mru() {
        let (_dir, store) = store();
        for i in 0..12 {
            store.add_recent_file(&format!("cfg-{i}.json")).unwrap();
        }
        let files = store.recent_files();
        assert_eq!(files.len(), MAX_RECENT_FILES);
        assert_eq!(files[0], "cfg-11.json");

        store.add_recent_file("cfg-5.json").unwrap();
        let files = store.recent_files();
        assert_eq!(files[0], "cfg-5.json");
        assert_eq!(files.iter().filter(|f| *f == "cfg-5.json").count(), 1);
    }

    #[test]
    fn corrupt_document_falls_back_to_default() {
        let (_dir, store) = store();
        std::fs::write(store.dir().join(PROFILES_FILE), "{not json").unwrap();
        assert!(store.list_profiles().is_empty());
    }

    #[test]
    fn routing_rules_deduplicate_preserving_order() {
        let (_dir, store) = store();
        let rules = RoutingRules {
            direct: vec!["a.com".into(), "b.com".into(), "a.com".into()],
            proxy: vec![],
            block: vec![],
        };
        store.set_routing_rules(rules).unwrap();
        assert_eq!(store.routing_rules().direct, vec!["a.com", "b.com"]);
    }

    #[test]
    fn subscription_update_replaces_profiles() {
        let (_dir, store) = store();
        let sub = store
            .save_subscription(Subscription {
                id: String::new(),
                name: "remote".to_string(),
                url: "https://example.com/sub".to_string(),
                profiles: Vec::new(),
                created_at: 0,
            })
            .unwrap();

        let body = "trojan://pw@a.example.com:443#A\ngarbage-line\n";
        let (added, errors) = store.apply_subscription_update(&sub.id, body).unwrap();
        assert_eq!(added, 1);
        assert_eq!(errors.len(), 1);

        let loaded = store.get_subscription(&sub.id).unwrap();
        assert_eq!(loaded.profiles.len(), 1);
        assert!(!loaded.profiles[0].id.is_empty());
    }

    #[test]
    fn boolean_settings_round_trip() {
        let (_dir, store) = store();
        assert!(store.auto_reconnect_enabled());
        assert!(!store.remember_close_choice());
        assert!(!store.startup_enabled());

        store.set_auto_reconnect_enabled(false).unwrap();
        store.set_remember_close_choice(true).unwrap();
        store.set_startup_enabled(true).unwrap();

        assert!(!store.auto_reconnect_enabled());
        assert!(store.remember_close_choice());
        assert!(store.startup_enabled());

        store.write_setting("auto_reconnect", "maybe").unwrap();
        assert!(store.auto_reconnect_enabled());
    }

    #[test]
    fn assigned_subscription_ids_are_stable_across_loads() {
        let (_dir, store) = store();
        let doc = json!([{
            "id": "s1",
            "name": "remote",
            "url": "https://example.com/sub",
            "profiles": [{
                "name": "imported",
                "config": { "outbounds": [{ "protocol": "vless", "address": "a.example.com", "port": 443 }] }
            }],
            "created_at": 1
        }]);
        std::fs::write(
            store.dir().join(SUBSCRIPTIONS_FILE),
            serde_json::to_string_pretty(&doc).unwrap(),
        )
        .unwrap();

        let first = store.list_subscriptions();
        let assigned = first[0].profiles[0].id.clone();
        assert!(!assigned.is_empty());

        let second = store.list_subscriptions();
        assert_eq!(second[0].profiles[0].id, assigned);
    }

    #[test]
    fn dns_config_defaults_to_two_resolvers() {
        let (_dir, store) = store();
        let dns = store.dns_config();
        assert_eq!(dns.len(), 2);
        assert_eq!(dns[0].address, "1.1.1.1");
    }
}
