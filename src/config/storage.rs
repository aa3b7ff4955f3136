//! Configuration Storage
//!
//! Persists store configs per environment in a single JSON file:
//! `{ "<env>": { "<store>": <raw config> } }`. Raw values keep their
//! `{{ VAR }}` templates on disk; reads interpolate and validate a copy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::schema::validate;
use super::template::{interpolate, EnvSource, ProcessEnv};
use super::types::StoreConfig;
use crate::error::KvError;

/// Directory holding the config file, relative to the project root
pub const CONFIG_DIR: &str = "_kvlink";
/// Config file name
pub const CONFIG_FILE: &str = "kv.json";
/// Process variable naming the runtime environment
pub const RUNTIME_ENV_VAR: &str = "KVLINK_ENV";
/// Runtime environment used when none is set
pub const DEVELOPMENT_ENV: &str = "development";

const GITIGNORE: &str = ".gitignore";

/// Runtime environment of this process
pub fn runtime_env() -> String {
    std::env::var(RUNTIME_ENV_VAR)
        .ok()
        .filter(|env| !env.is_empty())
        .unwrap_or_else(|| DEVELOPMENT_ENV.to_string())
}

/// Per-environment store configuration manager
pub struct ConfigManager {
    root: PathBuf,
    runtime_env: String,
}

impl ConfigManager {
    /// Manager rooted at the current working directory
    pub fn new() -> Self {
        Self::with_root(PathBuf::from("."))
    }

    /// Manager rooted at a custom project directory (for testing)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            runtime_env: runtime_env(),
        }
    }

    /// Override the runtime environment used by the in-VPC policy
    pub fn with_runtime_env(mut self, env: impl Into<String>) -> Self {
        self.runtime_env = env.into();
        self
    }

    pub fn runtime_env(&self) -> &str {
        &self.runtime_env
    }

    /// Config file path relative to the root, as listed in `.gitignore`
    fn relative_path() -> String {
        format!("{}/{}", CONFIG_DIR, CONFIG_FILE)
    }

    /// Full config file path
    pub fn path(&self) -> PathBuf {
        self.root.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Check if config file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(self.path()).await.is_ok()
    }

    /// Load the raw persisted mapping
    pub async fn load(&self) -> Result<Map<String, Value>, KvError> {
        let path = self.path();
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KvError::ConfigNotFound(format!(
                    "No key-value config file found at \"{}\"",
                    path.display()
                )))
            }
            Err(e) => return Err(KvError::Io(e)),
        };
        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(KvError::invalid(format!(
                "Key-value config at \"{}\" must be a JSON object",
                path.display()
            ))),
            Err(e) => Err(KvError::invalid(format!(
                "Key-value config invalid at \"{}\": {}",
                path.display(),
                e
            ))),
        }
    }

    /// Validate `raw` and persist it under `[env][name]`.
    ///
    /// Templates are allowed in the stored value. Returns the validated form.
    pub async fn write(&self, env: &str, name: &str, raw: Value) -> Result<StoreConfig, KvError> {
        if env.is_empty() || name.is_empty() {
            return Err(KvError::invalid("env and name must be non-empty strings"));
        }
        let validated = validate(&raw, true).map_err(|e| e.within(name).within(env))?;

        let mut config = if self.exists().await {
            self.load().await?
        } else {
            self.create().await?;
            Map::new()
        };
        let entry = config
            .entry(env.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        match entry {
            Value::Object(stores) => {
                stores.insert(name.to_string(), raw);
            }
            other => {
                let mut stores = Map::new();
                stores.insert(name.to_string(), raw);
                *other = Value::Object(stores);
            }
        }
        self.save(&Value::Object(config)).await?;

        info!(
            "Wrote key-value credentials to \"{}\"[\"{}\"][\"{}\"]",
            self.path().display(),
            env,
            name
        );
        Ok(validated)
    }

    /// Read, interpolate and validate the config stored under `[env][name]`.
    ///
    /// `env_vars` defaults to the process environment.
    pub async fn read(
        &self,
        env: &str,
        name: &str,
        env_vars: Option<&HashMap<String, String>>,
    ) -> Result<StoreConfig, KvError> {
        let config = self.load().await?;
        let path = self.path();
        let stores = config.get(env).and_then(Value::as_object).ok_or_else(|| {
            KvError::ConfigNotFound(format!(
                "Environment \"{}\" not found in key-value config at \"{}\"",
                env,
                path.display()
            ))
        })?;
        let raw = stores.get(name).filter(|v| !v.is_null()).ok_or_else(|| {
            KvError::ConfigNotFound(format!(
                "Environment \"{}\" key-value \"{}\" not found in key-value config at \"{}\"",
                env,
                name,
                path.display()
            ))
        })?;

        let source: &dyn EnvSource = match env_vars {
            Some(vars) => vars,
            None => &ProcessEnv,
        };
        let resolved = interpolate(raw, source).map_err(|e| e.within(name).within(env))?;
        let mut validated = validate(&resolved, false).map_err(|e| e.within(name).within(env))?;

        // A live deployment tier inside the VPC reaches the store directly
        let is_live_environment = self.runtime_env == env && self.runtime_env != DEVELOPMENT_ENV;
        if is_live_environment && validated.in_vpc() {
            debug!("Dropping SSH tunnel for [\"{}\"][\"{}\"]: in_vpc", env, name);
            validated.strip_tunnel();
        }
        Ok(validated)
    }

    /// Remove the config file if present
    pub async fn destroy(&self) -> Result<(), KvError> {
        let path = self.path();
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(KvError::Io(e)),
        }
        info!("Destroyed key-value credentials at \"{}\"", path.display());
        Ok(())
    }

    /// Create an empty config file and register it in `.gitignore`
    async fn create(&self) -> Result<(), KvError> {
        if let Some(parent) = self.path().parent() {
            fs::create_dir_all(parent).await?;
        }
        self.save(&Value::Object(Map::new())).await?;
        self.append_gitignore().await
    }

    /// Write to temp file first, then rename (atomic write)
    async fn save(&self, config: &Value) -> Result<(), KvError> {
        let path = self.path();
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)
            .map_err(|e| KvError::invalid(format!("Could not serialize config: {}", e)))?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn append_gitignore(&self) -> Result<(), KvError> {
        append_ignore_entry(&self.root.join(GITIGNORE), &Self::relative_path()).await
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Ensure `entry` is listed in the ignore file at `gitignore`
async fn append_ignore_entry(gitignore: &Path, entry: &str) -> Result<(), KvError> {
    match fs::read_to_string(gitignore).await {
        Ok(contents) => {
            let mut lines: Vec<&str> = contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect();
            if !lines.contains(&entry) {
                lines.push(entry);
                info!("Appending \"{}\" to \"{}\"", entry, gitignore.display());
                fs::write(gitignore, lines.join("\n") + "\n").await?;
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::write(gitignore, format!("{}\n", entry)).await?;
            info!("Created \"{}\" containing \"{}\"", gitignore.display(), entry);
        }
        Err(e) => return Err(KvError::Io(e)),
    }
    Ok(())
}
