//! Two-layer registry of model entries and chat-template formats: an
//! embedded base directory overlaid by a user-mutable local directory, with
//! link resolution, per-provider defaults and pattern-matched format lookup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{OnceLock, RwLock};

use anyhow::Context;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::core::error::AugurError;
use crate::gen::GenConf;

/// Known provider prefixes
pub const PROVIDER_NAMES: &[&str] = &[
    "anthropic",
    "fireworks",
    "groq",
    "llamacpp",
    "mistral",
    "openai",
    "together",
];

/// Pseudo-provider namespace holding bare-name aliases
pub const ALIAS_PROVIDER: &str = "alias";

/// Per-provider wildcard sub-key carrying inherited defaults
pub const DEFAULT_ENTRY_NAME: &str = "_default";

pub const MODELS_CONF_FILENAME: &str = "models.json";
pub const FORMATS_CONF_FILENAME: &str = "formats.json";

/// ';'-delimited folder list where models and configs are searched at init
pub const ENV_VAR_NAME: &str = "AUGUR_MODELS";

const BASE_MODELS_JSON: &str = include_str!("res/base_models.json");
const BASE_FORMATS_JSON: &str = include_str!("res/base_formats.json");

type Dir = Map<String, JsonValue>;

fn is_provider(name: &str) -> bool {
    PROVIDER_NAMES.contains(&name) || name == ALIAS_PROVIDER
}

/// Typed view of a fused model entry: provider defaults overlaid with the
/// model's own entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Canonical model name as used on the wire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Chat-template format reference, for models that need one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Default generation configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genconf: Option<GenConf>,

    /// Context length shared by input and output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx_len: Option<usize>,

    /// Output token cap, where the provider imposes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_limit: Option<usize>,

    /// Overhead tokens accounted per message when estimating token length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overhead_per_msg: Option<usize>,

    /// Char-to-token multiplication factor used when no tokenizer is
    /// available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_estimation_factor: Option<f64>,

    /// Any other provider-specific creation values
    #[serde(flatten)]
    pub other: Map<String, JsonValue>,
}

/// A resolved chat-template format entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatEntry {
    pub template: String,
    /// Regex patterns matching model identifiers
    pub matches: Vec<String>,
}

/// Two-layer directory of model entries and chat-template formats.
/// The base layer is compiled into the binary; the local layer is mutable
/// and overrides base per-key.
#[derive(Debug)]
pub struct Registry {
    base_models: Dir,
    models: Dir,
    base_formats: Dir,
    formats: Dir,
    search_paths: Vec<PathBuf>,
}

impl Registry {
    /// A registry holding only the embedded base configuration.
    pub fn new() -> Result<Self, AugurError> {
        let base_models: Dir = serde_json::from_str(BASE_MODELS_JSON)
            .map_err(|e| AugurError::Config(format!("Bad embedded base models: {}", e)))?;
        let base_formats: Dir = serde_json::from_str(BASE_FORMATS_JSON)
            .map_err(|e| AugurError::Config(format!("Bad embedded base formats: {}", e)))?;

        let mut models = empty_models_dir();
        models.insert(ALIAS_PROVIDER.to_string(), JsonValue::Object(Map::new()));

        let registry = Registry {
            base_models,
            models,
            base_formats,
            formats: Map::new(),
            search_paths: Vec::new(),
        };
        sanity_check_models(&registry.base_models)?;
        sanity_check_formats(&registry.base_formats)?;
        Ok(registry)
    }

    /// A registry initialized from the embedded base plus the directories
    /// listed in the AUGUR_MODELS env variable (';'-delimited).
    pub fn with_env_dirs() -> Result<Self, AugurError> {
        let mut registry = Registry::new()?;
        if let Ok(paths) = std::env::var(ENV_VAR_NAME) {
            for path in paths.split(';').filter(|p| !p.is_empty()) {
                // a stale entry in the env list is not fatal
                if let Err(e) = registry.add_search_path(path) {
                    log::warn!("Skipping {} entry '{}': {}", ENV_VAR_NAME, path, e);
                }
            }
        }
        Ok(registry)
    }

    /// Process-wide default registry, for callers that don't carry their own.
    /// Mutations must not run concurrently with lookups.
    pub fn global() -> &'static RwLock<Registry> {
        static GLOBAL: OnceLock<RwLock<Registry>> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let registry = Registry::with_env_dirs()
                .or_else(|_| Registry::new())
                .expect("embedded base registry must parse");
            RwLock::new(registry)
        })
    }

    /// Add a search directory: any models.json/formats.json inside is merged
    /// into the local overlay, and the directory is remembered for model
    /// file lookup.
    pub fn add_search_path(&mut self, path: impl AsRef<Path>) -> Result<(), AugurError> {
        let path = path.as_ref();
        if path.is_dir() {
            if !self.search_paths.iter().any(|p| p == path) {
                self.search_paths.push(path.to_path_buf());
            }
            let models_path = path.join(MODELS_CONF_FILENAME);
            if models_path.is_file() {
                self.load_models_file(&models_path)?;
            }
            let formats_path = path.join(FORMATS_CONF_FILENAME);
            if formats_path.is_file() {
                self.load_formats_file(&formats_path)?;
            }
        } else if path.is_file() {
            if let Some(parent) = path.parent() {
                if !self.search_paths.iter().any(|p| p == parent) {
                    self.search_paths.push(parent.to_path_buf());
                }
            }
            if path.ends_with(MODELS_CONF_FILENAME) {
                self.load_models_file(path)?;
            } else if path.ends_with(FORMATS_CONF_FILENAME) {
                self.load_formats_file(path)?;
            }
        } else {
            return Err(AugurError::Config(format!(
                "Models path not found: '{}'",
                path.display()
            )));
        }
        Ok(())
    }

    /// Merge a models.json file into the local overlay.
    pub fn load_models_file(&mut self, path: impl AsRef<Path>) -> Result<(), AugurError> {
        let dir = read_json_file(path.as_ref())?;
        deep_merge(&mut self.models, &dir);
        sanity_check_models(&self.fused_models())?;
        info!("Loaded models from '{}'", path.as_ref().display());
        Ok(())
    }

    /// Merge a formats.json file into the local overlay.
    pub fn load_formats_file(&mut self, path: impl AsRef<Path>) -> Result<(), AugurError> {
        let dir = read_json_file(path.as_ref())?;
        deep_merge(&mut self.formats, &dir);
        sanity_check_formats(&self.fused_formats())?;
        info!("Loaded formats from '{}'", path.as_ref().display());
        Ok(())
    }

    /// Fused view of the model directories: local overrides base per-key.
    pub fn fused_models(&self) -> Dir {
        let mut out = self.base_models.clone();
        deep_merge(&mut out, &self.models);
        out
    }

    /// Fused view of the format directories.
    pub fn fused_formats(&self) -> Dir {
        let mut out = self.base_formats.clone();
        deep_merge(&mut out, &self.formats);
        out
    }

    /// Locate a model file by name in the registered search directories.
    pub fn locate_file(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.is_absolute() {
            return path.is_file().then(|| path.to_path_buf());
        }
        for dir in &self.search_paths {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    // ================================================= model resolution

    /// Resolve a model resource name into (provider, name), following string
    /// links. Bare names are treated as aliases. Cycle-safe: link chains
    /// revisiting a key fail.
    pub fn resolve_model(&self, res_name: &str) -> Result<(String, String), AugurError> {
        let fused = self.fused_models();
        resolve_model_in(&fused, res_name)
    }

    /// Resolve a model name into its fused creation entry: provider
    /// `_default` values overlaid with the model's own entry. The `_default`
    /// scope is lexical: local-overlay defaults apply only to local-overlay
    /// entries, base defaults to base entries.
    pub fn resolve_model_entry(
        &self,
        res_name: &str,
    ) -> Result<(String, String, ModelEntry), AugurError> {
        let fused = self.fused_models();
        let (provider, name) = resolve_model_in(&fused, res_name)?;

        let prov = fused
            .get(&provider)
            .and_then(|p| p.as_object())
            .cloned()
            .unwrap_or_default();

        let mut args = if prov.contains_key(&name) {
            let in_local = self
                .models
                .get(&provider)
                .and_then(|p| p.as_object())
                .map(|p| p.contains_key(&name))
                .unwrap_or(false);

            // lexical _default scoping
            let defaults = if in_local {
                prov.get(DEFAULT_ENTRY_NAME)
            } else {
                self.base_models
                    .get(&provider)
                    .and_then(|p| p.as_object())
                    .and_then(|p| p.get(DEFAULT_ENTRY_NAME))
            };

            let mut args = defaults
                .and_then(|d| d.as_object())
                .cloned()
                .unwrap_or_default();
            if !args.contains_key("name") {
                args.insert("name".to_string(), JsonValue::String(name.clone()));
            }
            if let Some(JsonValue::Object(entry)) = prov.get(&name) {
                deep_merge(&mut args, entry);
            }
            args
        } else {
            // unknown names pass through with provider defaults
            let mut args = prov
                .get(DEFAULT_ENTRY_NAME)
                .and_then(|d| d.as_object())
                .cloned()
                .unwrap_or_default();
            args.insert("name".to_string(), JsonValue::String(name.clone()));
            args
        };

        args.shift_remove(DEFAULT_ENTRY_NAME);
        let entry: ModelEntry = serde_json::from_value(JsonValue::Object(args))
            .map_err(|e| AugurError::Registry(format!("Bad entry for '{}': {}", res_name, e)))?;

        debug!("Resolved '{}' to {}:{}", res_name, provider, name);
        Ok((provider, name, entry))
    }

    pub fn has_model_entry(&self, res_name: &str) -> bool {
        match self.resolve_model(res_name) {
            Ok((provider, name)) => self
                .fused_models()
                .get(&provider)
                .and_then(|p| p.as_object())
                .map(|p| p.contains_key(&name))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Provider `_default` values for the given keys, from the fused view.
    pub fn provider_defaults(&self, provider: &str) -> ModelEntry {
        self.fused_models()
            .get(provider)
            .and_then(|p| p.get(DEFAULT_ENTRY_NAME))
            .and_then(|d| serde_json::from_value(d.clone()).ok())
            .unwrap_or_default()
    }

    /// List fused "provider:name" entries, optionally prefix-filtered.
    pub fn list_models(&self, prefix: &str) -> Vec<String> {
        let mut out = Vec::new();
        for (provider, entries) in self.fused_models() {
            if let JsonValue::Object(entries) = entries {
                for name in entries.keys() {
                    if name == DEFAULT_ENTRY_NAME {
                        continue;
                    }
                    let key = format!("{}:{}", provider, name);
                    if key.starts_with(prefix) {
                        out.push(key);
                    }
                }
            }
        }
        out
    }

    // ================================================= model mutation

    /// Set or replace an entry in the local overlay.
    pub fn set_model(&mut self, res_name: &str, entry: ModelEntry) -> Result<(), AugurError> {
        let (provider, name) = parse_res_name(res_name, true)?;
        let value = serde_json::to_value(&entry)
            .map_err(|e| AugurError::Serialization(e.to_string()))?;
        self.local_provider_mut(&provider)?
            .insert(name, value);
        Ok(())
    }

    /// Set a string link to another entry. The linked target must exist.
    pub fn set_model_link(&mut self, res_name: &str, link_to: &str) -> Result<(), AugurError> {
        let (provider, name) = parse_res_name(res_name, true)?;

        // validate the link target resolves
        let qualified = if link_to.contains(':') {
            link_to.to_string()
        } else {
            format!("{}:{}", provider, link_to)
        };
        self.resolve_model(&qualified)?;

        self.local_provider_mut(&provider)?
            .insert(name, JsonValue::String(link_to.to_string()));
        Ok(())
    }

    /// Update (merge) fields of an entry in the local overlay.
    pub fn update_model(
        &mut self,
        res_name: &str,
        fields: Map<String, JsonValue>,
    ) -> Result<(), AugurError> {
        let (provider, name) = parse_res_name(res_name, true)?;
        let prov = self.local_provider_mut(&provider)?;
        match prov.get_mut(&name) {
            Some(JsonValue::Object(entry)) => {
                deep_merge(entry, &fields);
                Ok(())
            }
            Some(_) => Err(AugurError::Registry(format!(
                "Entry '{}' is a link and cannot be updated",
                res_name
            ))),
            None => {
                prov.insert(name, JsonValue::Object(fields));
                Ok(())
            }
        }
    }

    /// Delete an entry from the local overlay. Refuses while other entries
    /// link to it, leaving the registry unchanged.
    pub fn delete_model(&mut self, res_name: &str) -> Result<(), AugurError> {
        let (provider, name) = parse_res_name(res_name, true)?;

        let fused = self.fused_models();
        let target = format!("{}:{}", provider, name);
        for (link_provider, entries) in &fused {
            if let JsonValue::Object(entries) = entries {
                for (link_name, value) in entries {
                    if let JsonValue::String(link_to) = value {
                        let qualified = if link_to.contains(':') {
                            link_to.clone()
                        } else {
                            format!("{}:{}", link_provider, link_to)
                        };
                        if qualified == target
                            && !(link_provider == &provider && link_name == &name)
                        {
                            return Err(AugurError::Registry(format!(
                                "Cannot delete '{}': entry '{}:{}' links to it",
                                target, link_provider, link_name
                            )));
                        }
                    }
                }
            }
        }

        let prov = self.local_provider_mut(&provider)?;
        if prov.shift_remove(&name).is_none() {
            return Err(AugurError::Registry(format!(
                "No entry '{}' in local directory",
                target
            )));
        }
        Ok(())
    }

    /// Save the local models overlay to a models.json file.
    pub fn save_models(&self, path: impl AsRef<Path>) -> Result<(), AugurError> {
        let text = serde_json::to_string_pretty(&self.models)
            .map_err(|e| AugurError::Serialization(e.to_string()))?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    fn local_provider_mut(&mut self, provider: &str) -> Result<&mut Dir, AugurError> {
        if !is_provider(provider) {
            return Err(AugurError::Registry(format!(
                "Unknown provider '{}', must be one of: {:?} or '{}'",
                provider, PROVIDER_NAMES, ALIAS_PROVIDER
            )));
        }
        let entry = self
            .models
            .entry(provider.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
        entry.as_object_mut().ok_or_else(|| {
            AugurError::Registry(format!("Provider '{}' entry is not an object", provider))
        })
    }

    // ================================================= formats

    /// Get a resolved format entry by exact name, following string links and
    /// template-field links. Names are matched case-insensitively.
    pub fn get_format_entry(&self, name: &str) -> Option<(String, FormatEntry)> {
        let fused = self.fused_formats();
        get_format_entry_in(&fused, name)
    }

    /// Find a format by pattern-matching a model identifier against each
    /// entry's regex list, in declaration order, case-insensitive. First
    /// match wins.
    pub fn match_format_entry(&self, model_id: &str) -> Option<(String, FormatEntry)> {
        let fused = self.fused_formats();
        search_format_in(&fused, model_id)
    }

    /// The chat template for a format name, if known.
    pub fn get_format_template(&self, name: &str) -> Option<String> {
        self.get_format_entry(name).map(|(_, e)| e.template)
    }

    /// Search for a chat template for a local model file: a
    /// models.json/formats.json pair co-located with the model file is
    /// consulted before the registry's pattern matching.
    pub fn find_format_for_model_file(&self, model_path: &Path) -> Option<(String, FormatEntry)> {
        let filename = model_path.file_name()?.to_string_lossy().to_string();

        if let Some(dir) = model_path.parent() {
            // folder formats.json: pattern match against the filename
            let formats_path = dir.join(FORMATS_CONF_FILENAME);
            let folder_formats = read_json_file(&formats_path).ok();
            if let Some(folder_formats) = &folder_formats {
                if let Some(found) = search_format_in(folder_formats, &filename) {
                    debug!("Found format '{}' in '{}'", found.0, formats_path.display());
                    return Some(found);
                }
            }

            // folder models.json: an llamacpp entry for this file may name
            // its format
            let models_path = dir.join(MODELS_CONF_FILENAME);
            if let Ok(folder_models) = read_json_file(&models_path) {
                let format_name = folder_models
                    .get("llamacpp")
                    .and_then(|p| p.as_object())
                    .and_then(|p| {
                        p.values().find_map(|entry| {
                            let entry = entry.as_object()?;
                            let entry_name = entry.get("name")?.as_str()?;
                            if entry_name == filename {
                                entry.get("format")?.as_str().map(|s| s.to_string())
                            } else {
                                None
                            }
                        })
                    });
                if let Some(format_name) = format_name {
                    if let Some(folder_formats) = &folder_formats {
                        if let Some(found) = get_format_entry_in(folder_formats, &format_name) {
                            return Some(found);
                        }
                    }
                    if let Some(found) = self.get_format_entry(&format_name) {
                        return Some(found);
                    }
                }
            }
        }

        self.match_format_entry(&filename)
    }

    /// Set or replace a format entry in the local overlay.
    pub fn set_format(
        &mut self,
        name: &str,
        template: &str,
        matches: &[&str],
    ) -> Result<(), AugurError> {
        let mut entry = Map::new();
        entry.insert(
            "template".to_string(),
            JsonValue::String(template.to_string()),
        );
        if !matches.is_empty() {
            entry.insert(
                "match".to_string(),
                JsonValue::Array(
                    matches
                        .iter()
                        .map(|m| JsonValue::String(m.to_string()))
                        .collect(),
                ),
            );
        }
        self.formats
            .insert(name.to_lowercase(), JsonValue::Object(entry));
        Ok(())
    }

    /// Set a string link to another format entry. The target must exist.
    pub fn set_format_link(&mut self, name: &str, link_to: &str) -> Result<(), AugurError> {
        if self.get_format_entry(link_to).is_none() {
            return Err(AugurError::Registry(format!(
                "Format link target '{}' does not exist",
                link_to
            )));
        }
        self.formats.insert(
            name.to_lowercase(),
            JsonValue::String(link_to.to_string()),
        );
        Ok(())
    }

    /// Delete a format from the local overlay. Refuses while other entries
    /// link to it.
    pub fn delete_format(&mut self, name: &str) -> Result<(), AugurError> {
        let name = name.to_lowercase();
        let fused = self.fused_formats();
        for (link_name, value) in &fused {
            let links_here = match value {
                JsonValue::String(link_to) => link_to == &name,
                JsonValue::Object(entry) => matches!(
                    entry.get("template"), Some(JsonValue::String(t)) if !t.contains("{{") && t == &name
                ),
                _ => false,
            };
            if links_here && link_name != &name {
                return Err(AugurError::Registry(format!(
                    "Cannot delete format '{}': entry '{}' links to it",
                    name, link_name
                )));
            }
        }
        if self.formats.shift_remove(&name).is_none() {
            return Err(AugurError::Registry(format!(
                "No format '{}' in local directory",
                name
            )));
        }
        Ok(())
    }

    /// List fused format names, optionally prefix-filtered.
    pub fn list_formats(&self, prefix: &str) -> Vec<String> {
        self.fused_formats()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Save the local formats overlay to a formats.json file.
    pub fn save_formats(&self, path: impl AsRef<Path>) -> Result<(), AugurError> {
        let text = serde_json::to_string_pretty(&self.formats)
            .map_err(|e| AugurError::Serialization(e.to_string()))?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }
}

// ================================================= free helpers

fn empty_models_dir() -> Dir {
    let mut out = Map::new();
    for provider in PROVIDER_NAMES {
        out.insert(provider.to_string(), JsonValue::Object(Map::new()));
    }
    out
}

fn read_json_file(path: &Path) -> Result<Dir, AugurError> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading '{}'", path.display()))
        .map_err(|e| AugurError::Config(e.to_string()))?;
    serde_json::from_str(&text)
        .map_err(|e| AugurError::Config(format!("Bad JSON in '{}': {}", path.display(), e)))
}

/// Recursive merge: source objects merge into destination objects, any other
/// value replaces.
fn deep_merge(dst: &mut Dir, src: &Dir) {
    for (k, v) in src {
        match (dst.get_mut(k), v) {
            (Some(JsonValue::Object(dst_sub)), JsonValue::Object(src_sub)) => {
                deep_merge(dst_sub, src_sub);
            }
            _ => {
                dst.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Split "provider:name" or treat a bare name as an alias.
fn parse_res_name(res_name: &str, allow_alias: bool) -> Result<(String, String), AugurError> {
    match res_name.split_once(':') {
        Some((provider, name)) => {
            if name.contains(':') {
                return Err(AugurError::Registry(format!(
                    "Model resource name must be in the format provider:model_name (for '{}')",
                    res_name
                )));
            }
            if !is_provider(provider) {
                return Err(AugurError::Registry(format!(
                    "Don't know how to handle provider '{}'. Can only handle: {:?} or '{}'",
                    provider, PROVIDER_NAMES, ALIAS_PROVIDER
                )));
            }
            Ok((provider.to_string(), name.to_string()))
        }
        None => {
            if allow_alias {
                Ok((ALIAS_PROVIDER.to_string(), res_name.to_string()))
            } else {
                Err(AugurError::Registry(format!(
                    "Alias not allowed (for '{}')",
                    res_name
                )))
            }
        }
    }
}

/// Follow string links until a non-link entry or an unknown passthrough
/// name. Cycle-safe via a visited set.
fn resolve_model_in(fused: &Dir, res_name: &str) -> Result<(String, String), AugurError> {
    let mut res_name = res_name.to_string();
    let mut visited: HashSet<String> = HashSet::new();

    loop {
        if !visited.insert(res_name.clone()) {
            return Err(AugurError::Registry(format!(
                "Link cycle detected while resolving '{}'",
                res_name
            )));
        }

        let (provider, name) = parse_res_name(&res_name, true)?;
        let prov = fused.get(&provider).and_then(|p| p.as_object());

        match prov.and_then(|p| p.get(&name)) {
            Some(JsonValue::String(link)) => {
                res_name = if link.contains(':') {
                    link.clone()
                } else {
                    // a local link within the same provider
                    format!("{}:{}", provider, link)
                };
            }
            None if provider == ALIAS_PROVIDER => {
                return Err(AugurError::Registry(format!(
                    "Alias not found for '{}'. Did you mean 'llamacpp:{}' or 'openai:{}'?",
                    name, name, name
                )));
            }
            _ => return Ok((provider, name)),
        }
    }
}

fn format_entry_from_value(
    formats: &Dir,
    name: &str,
    value: &JsonValue,
) -> Option<FormatEntry> {
    let entry = value.as_object()?;
    let mut template = entry.get("template")?.as_str()?.to_string();

    // a template value without any expansion is a link to another entry
    if !template.contains("{{") {
        let linked = formats.get(&template).or_else(|| {
            let lower = template.to_lowercase();
            formats.get(&lower)
        })?;
        template = linked.as_object()?.get("template")?.as_str()?.to_string();
        if !template.contains("{{") {
            log::warn!("Broken template link at '{}'", name);
            return None;
        }
    }

    let matches = match entry.get("match") {
        Some(JsonValue::String(p)) => vec![p.clone()],
        Some(JsonValue::Array(ps)) => ps
            .iter()
            .filter_map(|p| p.as_str().map(|s| s.to_string()))
            .collect(),
        _ => Vec::new(),
    };

    Some(FormatEntry { template, matches })
}

fn get_format_entry_in(formats: &Dir, name: &str) -> Option<(String, FormatEntry)> {
    let mut name = name.to_lowercase();
    let mut visited: HashSet<String> = HashSet::new();

    while let Some(value) = formats.get(&name) {
        if !visited.insert(name.clone()) {
            return None;
        }
        match value {
            JsonValue::String(link) => name = link.to_lowercase(),
            other => {
                let entry = format_entry_from_value(formats, &name, other)?;
                return Some((name, entry));
            }
        }
    }
    None
}

fn search_format_in(formats: &Dir, model_id: &str) -> Option<(String, FormatEntry)> {
    for (name, value) in formats {
        let entry = match value {
            // links are ignored when searching
            JsonValue::Object(entry) => entry,
            _ => continue,
        };
        let patterns: Vec<String> = match entry.get("match") {
            Some(JsonValue::String(p)) => vec![p.clone()],
            Some(JsonValue::Array(ps)) => ps
                .iter()
                .filter_map(|p| p.as_str().map(|s| s.to_string()))
                .collect(),
            _ => continue,
        };
        for pattern in patterns {
            let compiled = regex::RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .build();
            if let Ok(compiled) = compiled {
                if compiled.is_match(model_id) {
                    info!("Format search for '{}' found '{}' entry", model_id, name);
                    let entry = format_entry_from_value(formats, name, value)?;
                    return Some((name.clone(), entry));
                }
            }
        }
    }
    None
}

fn sanity_check_models(models: &Dir) -> Result<(), AugurError> {
    for (provider, entries) in models {
        if !is_provider(provider) {
            return Err(AugurError::Config(format!(
                "Unknown provider '{}' in models directory",
                provider
            )));
        }
        let Some(entries) = entries.as_object() else {
            return Err(AugurError::Config(format!(
                "Provider '{}' must map to an object of entries",
                provider
            )));
        };
        for (name, value) in entries {
            if provider == ALIAS_PROVIDER && !value.is_string() {
                return Err(AugurError::Config(format!(
                    "Alias entries must be strings at {}:{}",
                    provider, name
                )));
            }
            if name == DEFAULT_ENTRY_NAME && !value.is_object() {
                return Err(AugurError::Config(format!(
                    "The '{}' entry of provider '{}' must be an object",
                    DEFAULT_ENTRY_NAME, provider
                )));
            }
            if !value.is_object() && !value.is_string() {
                return Err(AugurError::Config(format!(
                    "Entry {}:{} must be an object or a string link",
                    provider, name
                )));
            }
        }
    }
    Ok(())
}

fn sanity_check_formats(formats: &Dir) -> Result<(), AugurError> {
    for (name, value) in formats {
        match value {
            JsonValue::String(link) => {
                if !formats.contains_key(link) {
                    return Err(AugurError::Config(format!(
                        "Format entry '{}' points to non-existent entry '{}'",
                        name, link
                    )));
                }
            }
            JsonValue::Object(entry) => {
                if !entry.contains_key("template") {
                    return Err(AugurError::Config(format!(
                        "Format entry '{}' must have a 'template' value",
                        name
                    )));
                }
            }
            _ => {
                return Err(AugurError::Config(format!(
                    "Format entry '{}' must be an object or a string link",
                    name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base_registry_parses() {
        let registry = Registry::new().unwrap();
        assert!(registry.get_format_template("chatml").is_some());
        let (provider, name) = registry.resolve_model("openai:gpt-4o").unwrap();
        assert_eq!(provider, "openai");
        assert_eq!(name, "gpt-4o");
    }

    #[test]
    fn test_link_resolution_qualifies_provider() {
        let registry = Registry::new().unwrap();
        // base has openai:gpt-3.5 -> gpt-3.5-turbo (unqualified link)
        let (provider, name) = registry.resolve_model("openai:gpt-3.5").unwrap();
        assert_eq!(provider, "openai");
        assert_eq!(name, "gpt-3.5-turbo");
    }

    #[test]
    fn test_resolution_idempotent() {
        let registry = Registry::new().unwrap();
        let (p1, n1) = registry.resolve_model("openai:gpt-3.5").unwrap();
        let resolved = format!("{}:{}", p1, n1);
        let (p2, n2) = registry.resolve_model(&resolved).unwrap();
        assert_eq!((p1, n1), (p2, n2));
    }

    #[test]
    fn test_alias_resolution() {
        let mut registry = Registry::new().unwrap();
        registry
            .set_model_link("alias:fast", "openai:gpt-4o-mini")
            .unwrap();
        let (provider, name) = registry.resolve_model("fast").unwrap();
        assert_eq!(provider, "openai");
        assert_eq!(name, "gpt-4o-mini");

        assert!(registry.resolve_model("missing-alias").is_err());
    }

    #[test]
    fn test_link_cycle_detected() {
        let mut registry = Registry::new().unwrap();
        // create links a -> b, then b -> a directly in the local overlay, as
        // set_model_link would refuse the broken target
        registry
            .local_provider_mut("openai")
            .unwrap()
            .insert("a".to_string(), json!("b"));
        registry
            .local_provider_mut("openai")
            .unwrap()
            .insert("b".to_string(), json!("a"));
        assert!(registry.resolve_model("openai:a").is_err());
    }

    #[test]
    fn test_entry_fusion_with_defaults() {
        let registry = Registry::new().unwrap();
        let (_, _, entry) = registry.resolve_model_entry("openai:gpt-4o").unwrap();
        assert_eq!(entry.ctx_len, Some(128000));
        assert_eq!(entry.max_tokens_limit, Some(16384));
        // inherited from openai _default
        assert_eq!(entry.token_estimation_factor, Some(0.4));
        assert_eq!(entry.name.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_unknown_name_passes_through() {
        let registry = Registry::new().unwrap();
        let (provider, name, entry) = registry
            .resolve_model_entry("openai:gpt-someday")
            .unwrap();
        assert_eq!(provider, "openai");
        assert_eq!(name, "gpt-someday");
        // provider defaults still apply
        assert_eq!(entry.ctx_len, Some(4096));
    }

    #[test]
    fn test_local_overrides_base() {
        let mut registry = Registry::new().unwrap();
        registry
            .set_model(
                "openai:gpt-4o",
                ModelEntry {
                    ctx_len: Some(9999),
                    ..Default::default()
                },
            )
            .unwrap();
        let (_, _, entry) = registry.resolve_model_entry("openai:gpt-4o").unwrap();
        assert_eq!(entry.ctx_len, Some(9999));
    }

    #[test]
    fn test_delete_refuses_inbound_links() {
        let mut registry = Registry::new().unwrap();
        registry
            .set_model(
                "openai:mine",
                ModelEntry {
                    ctx_len: Some(1000),
                    ..Default::default()
                },
            )
            .unwrap();
        registry.set_model_link("alias:short", "openai:mine").unwrap();

        let err = registry.delete_model("openai:mine");
        assert!(err.is_err());
        // registry unchanged
        assert!(registry.has_model_entry("openai:mine"));

        registry.delete_model("alias:short").unwrap();
        registry.delete_model("openai:mine").unwrap();
        assert!(!registry.has_model_entry("openai:mine"));
    }

    #[test]
    fn test_format_pattern_match() {
        let registry = Registry::new().unwrap();
        let (name, entry) = registry
            .match_format_entry("Meta-Llama-3-8B-Instruct.Q4_K_M.gguf")
            .unwrap();
        assert_eq!(name, "llama3");
        assert!(entry.template.contains("start_header_id"));

        // first match in declaration order wins, case-insensitive
        let (name, _) = registry.match_format_entry("MIXTRAL-8x7b.gguf").unwrap();
        assert_eq!(name, "mistral-instruct");
    }

    #[test]
    fn test_format_link_following() {
        let registry = Registry::new().unwrap();
        // base has tinyllama -> zephyr
        let (name, entry) = registry.get_format_entry("tinyllama").unwrap();
        assert_eq!(name, "zephyr");
        assert!(entry.template.contains("<|assistant|>"));
    }

    #[test]
    fn test_set_format_and_save() {
        let mut registry = Registry::new().unwrap();
        registry
            .set_format("mymodel", "{{ messages }}", &["my-?model"])
            .unwrap();
        let (name, _) = registry.match_format_entry("My-Model-7B.gguf").unwrap();
        assert_eq!(name, "mymodel");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FORMATS_CONF_FILENAME);
        registry.save_formats(&path).unwrap();

        let mut restored = Registry::new().unwrap();
        restored.load_formats_file(&path).unwrap();
        assert!(restored.get_format_template("mymodel").is_some());
    }

    #[test]
    fn test_env_var_dirs_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MODELS_CONF_FILENAME),
            r#"{ "alias": { "envmodel": "openai:gpt-4o" } }"#,
        )
        .unwrap();

        let mut registry = Registry::new().unwrap();
        registry.add_search_path(dir.path()).unwrap();
        let (provider, name) = registry.resolve_model("envmodel").unwrap();
        assert_eq!(provider, "openai");
        assert_eq!(name, "gpt-4o");
    }

    #[test]
    fn test_folder_format_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("custom-model.Q4.gguf");
        std::fs::write(&model_path, b"gguf").unwrap();
        std::fs::write(
            dir.path().join(FORMATS_CONF_FILENAME),
            r#"{ "custom": { "match": ["custom-model"], "template": "{{ messages }}" } }"#,
        )
        .unwrap();

        let registry = Registry::new().unwrap();
        let (name, entry) = registry.find_format_for_model_file(&model_path).unwrap();
        assert_eq!(name, "custom");
        assert_eq!(entry.template, "{{ messages }}");
    }

    #[test]
    fn test_genconf_in_entry() {
        let mut registry = Registry::new().unwrap();
        registry
            .set_model(
                "openai:tuned",
                ModelEntry {
                    name: Some("gpt-4o".to_string()),
                    genconf: Some(GenConf::new().with_temperature(0.9)),
                    ..Default::default()
                },
            )
            .unwrap();
        let (_, _, entry) = registry.resolve_model_entry("openai:tuned").unwrap();
        assert_eq!(entry.genconf.unwrap().temperature, 0.9);
    }
}
