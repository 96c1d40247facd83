//! Configuration Loader
//!
//! Resolution happens in four steps:
//!
//! 1. locate `scheduler-config.yaml` (or `.yml`) in the configuration directory
//! 2. overlay the section named after the active environment onto the base document
//! 3. layer `SCHEDULER__SECTION__KEY` environment variables on top via the `config` crate
//! 4. deserialize into [`SchedulerConfig`] and validate

use super::error::{ConfigResult, ConfigurationError};
use super::SchedulerConfig;
use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Value as YamlValue};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const CONFIG_FILE_NAMES: [&str; 2] = ["scheduler-config.yaml", "scheduler-config.yml"];
const ENVIRONMENTS: [&str; 3] = ["development", "test", "production"];
const ENV_PREFIX: &str = "SCHEDULER";
const ENV_SEPARATOR: &str = "__";
const MAX_FILE_BYTES: u64 = 1024 * 1024;
const SECRET_MARKERS: [&str; 4] = ["password", "secret", "token", "credential"];

/// Resolved configuration of one node together with where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: SchedulerConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Detect the environment and load from the default directory
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory_with_env(config_dir, &Self::detect_environment())
    }

    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let directory = config_dir.unwrap_or_else(default_directory);
        let file = locate(&directory)?;
        debug!(environment, file = %file.display(), "Resolving scheduler configuration");

        let document = overlay_environment(read_document(&file)?, environment)?;
        let mut config = layer_environment_variables(&document, &file)?;
        config.environment = environment.to_string();
        config.validate()?;

        info!(
            environment,
            node_id = ?config.node.id,
            max_jobs_per_acquisition = config.job_acquisition.max_jobs_per_acquisition,
            max_concurrent_batches = config.job_execution.max_concurrent_batches,
            "⚙️ Configuration loaded"
        );
        debug!(config = %mask_secrets(&config), "Resolved configuration");

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: directory,
        }))
    }

    /// Wrap an already built configuration, e.g. in tests
    pub fn from_config(config: SchedulerConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            environment: config.environment.clone(),
            config,
            config_directory: PathBuf::from("config"),
        }))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Configuration as JSON with secrets and the database url masked
    pub fn debug_config(&self) -> JsonValue {
        mask_secrets(&self.config)
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// `SCHEDULER_ENV`, then `APP_ENV`, else `development`
    pub fn detect_environment() -> String {
        ["SCHEDULER_ENV", "APP_ENV"]
            .iter()
            .find_map(|name| env::var(name).ok().filter(|value| !value.is_empty()))
            .map(|value| value.to_lowercase())
            .unwrap_or_else(|| "development".to_string())
    }

    /// Deep-merge `overlay` into `base`; mappings merge key by key, anything else replaces
    pub(crate) fn merge_yaml_values(base: &mut YamlValue, overlay: YamlValue) -> ConfigResult<()> {
        match (base, overlay) {
            (YamlValue::Mapping(target), YamlValue::Mapping(source)) => {
                for (key, value) in source {
                    match target.get_mut(&key) {
                        Some(slot) => Self::merge_yaml_values(slot, value)?,
                        None => {
                            target.insert(key, value);
                        }
                    }
                }
            }
            (slot, value) => *slot = value,
        }
        Ok(())
    }
}

fn default_directory() -> PathBuf {
    if let Ok(dir) = env::var("SCHEDULER_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    env::var("CARGO_MANIFEST_DIR")
        .map(|manifest| PathBuf::from(manifest).join("config"))
        .ok()
        .filter(|dir| dir.is_dir())
        .unwrap_or_else(|| PathBuf::from("config"))
}

fn locate(directory: &Path) -> ConfigResult<PathBuf> {
    let candidates: Vec<PathBuf> = CONFIG_FILE_NAMES
        .iter()
        .map(|name| directory.join(name))
        .collect();
    match candidates.iter().find(|path| path.is_file()) {
        Some(found) => Ok(found.clone()),
        None => Err(ConfigurationError::config_file_not_found(candidates)),
    }
}

fn read_document(file: &Path) -> ConfigResult<YamlValue> {
    let source = file.display().to_string();
    let size = std::fs::metadata(file)
        .map_err(|e| ConfigurationError::file_read_error(source.clone(), e))?
        .len();
    if size > MAX_FILE_BYTES {
        return Err(ConfigurationError::invalid_value(
            "file_size",
            size.to_string(),
            "configuration file larger than 1MB",
        ));
    }

    let text = std::fs::read_to_string(file)
        .map_err(|e| ConfigurationError::file_read_error(source.clone(), e))?;
    serde_yaml::from_str(&text).map_err(|e| ConfigurationError::invalid_yaml(source, e))
}

/// Apply the active environment's section and drop every environment section
fn overlay_environment(document: YamlValue, environment: &str) -> ConfigResult<YamlValue> {
    let YamlValue::Mapping(mut root) = document else {
        return Ok(YamlValue::Mapping(Mapping::new()));
    };
    let overlay = root.get(environment).cloned();
    for name in ENVIRONMENTS {
        root.remove(name);
    }

    let mut resolved = YamlValue::Mapping(root);
    if let Some(overlay) = overlay {
        debug!(environment, "Applying environment section");
        ConfigManager::merge_yaml_values(&mut resolved, overlay)?;
    }
    Ok(resolved)
}

fn layer_environment_variables(document: &YamlValue, file: &Path) -> ConfigResult<SchedulerConfig> {
    let rendered = serde_yaml::to_string(document).map_err(|e| ConfigurationError::ConfigMergeError {
        error: e.to_string(),
    })?;

    config::Config::builder()
        .add_source(config::File::from_str(&rendered, config::FileFormat::Yaml))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
        .map_err(|e| ConfigurationError::invalid_yaml(file.display().to_string(), e))
}

fn mask_secrets(config: &SchedulerConfig) -> JsonValue {
    let mut json = serde_json::to_value(config).unwrap_or(JsonValue::Null);
    mask_value(&mut json);
    if let Some(url) = json.pointer_mut("/database/url").filter(|url| url.is_string()) {
        *url = JsonValue::from("[MASKED]");
    }
    json
}

fn mask_value(value: &mut JsonValue) {
    match value {
        JsonValue::Object(fields) => {
            for (key, field) in fields.iter_mut() {
                let key = key.to_lowercase();
                if SECRET_MARKERS.iter().any(|marker| key.contains(marker)) {
                    *field = JsonValue::from("[MASKED]");
                } else {
                    mask_value(field);
                }
            }
        }
        JsonValue::Array(items) => items.iter_mut().for_each(mask_value),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticUserConfig;
    use std::fs;
    use tempfile::TempDir;

    const BASE_YAML: &str = r#"
node:
  id: engine-base
job_acquisition:
  max_jobs_per_acquisition: 5
  lock_time_in_millis: 120000
fetch_and_lock:
  backoff_divisor: 10
test:
  node:
    id: engine-test
  job_acquisition:
    lock_time_in_millis: 1000
"#;

    fn write_config(contents: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("scheduler-config.yaml"), contents).unwrap();
        dir
    }

    #[test]
    fn test_environment_section_overrides_base() {
        let dir = write_config(BASE_YAML);

        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap();
        let config = manager.config();

        assert_eq!(manager.environment(), "test");
        assert_eq!(config.node.id.as_deref(), Some("engine-test"));
        assert_eq!(config.job_acquisition.lock_time_in_millis, 1000);
        // Untouched keys keep the base value
        assert_eq!(config.job_acquisition.max_jobs_per_acquisition, 5);
        // Absent sections fall back to defaults
        assert!(config.job_execution.continue_batch_on_failure);
    }

    #[test]
    fn test_base_applies_without_environment_section() {
        let dir = write_config(BASE_YAML);
        let manager = ConfigManager::load_from_directory_with_env(
            Some(dir.path().to_path_buf()),
            "production",
        )
        .unwrap();
        assert_eq!(manager.config().node.id.as_deref(), Some("engine-base"));
        assert_eq!(manager.config().job_acquisition.lock_time_in_millis, 120_000);
    }

    #[test]
    fn test_missing_file_lists_searched_paths() {
        let dir = TempDir::new().unwrap();
        let err =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::ConfigFileNotFound { ref searched_paths } if searched_paths.len() == 2
        ));
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let dir = write_config("job_execution:\n  max_concurrent_batches: 0\n");
        let err =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    }

    #[test]
    fn test_merge_replaces_scalars_and_merges_maps() {
        let mut base: YamlValue = serde_yaml::from_str("a: 1\nb:\n  c: 2\n  d: 3\n").unwrap();
        let overrides: YamlValue = serde_yaml::from_str("b:\n  d: 4\ne: 5\n").unwrap();
        ConfigManager::merge_yaml_values(&mut base, overrides).unwrap();

        assert_eq!(base["a"], YamlValue::from(1));
        assert_eq!(base["b"]["c"], YamlValue::from(2));
        assert_eq!(base["b"]["d"], YamlValue::from(4));
        assert_eq!(base["e"], YamlValue::from(5));
    }

    #[test]
    fn test_debug_config_masks_passwords() {
        let mut config = SchedulerConfig::default();
        config.auth.users.push(StaticUserConfig {
            id: "worker".to_string(),
            password: "hunter2".to_string(),
            ..Default::default()
        });
        config.database.url = Some("postgresql://u:secret@db/leases".to_string());

        let manager = ConfigManager::from_config(config).unwrap();
        let dump = manager.debug_config().to_string();

        assert!(!dump.contains("hunter2"));
        assert!(!dump.contains("u:secret"));
        assert!(dump.contains("worker"));
    }
}
