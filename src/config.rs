use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::AppError;

const CONFIG_FILE: &str = "config.yaml";
const APP_DIR: &str = "qc";
/// Organisation value meaning "no default organisation"
const NO_ORGANISATION: &str = "-";

/// `registry:` section of config.yaml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub url: String,
    pub kubeconfig_path: String,
    pub secret_name: String,
    pub secret_namespace: String,
}

/// On-disk configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YamlConfig {
    pub registry: RegistrySection,
    pub organisation: String,
}

impl YamlConfig {
    /// Template written by `qc init-config` when nothing is configured yet
    pub fn example() -> Self {
        Self {
            registry: RegistrySection {
                url: "https://quay.io".to_string(),
                kubeconfig_path: "$KUBECONFIG".to_string(),
                secret_name: "Name of secret for quay admin user".to_string(),
                secret_namespace: "Namespace of secret for quay admin user".to_string(),
            },
            organisation: "optional set here the default organisation".to_string(),
        }
    }
}

/// ./config.yaml, then ~/.config/qc/config.yaml, then /etc/qc/config.yaml
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE)];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config").join(APP_DIR).join(CONFIG_FILE));
    }
    paths.push(PathBuf::from("/etc").join(APP_DIR).join(CONFIG_FILE));
    paths
}

/// Load the first config file that exists. No file at all yields defaults;
/// a file that exists but does not parse is an error.
pub fn load_yaml_config(paths: &[PathBuf]) -> Result<YamlConfig, AppError> {
    for path in paths {
        if !path.is_file() {
            continue;
        }
        debug!("Loading config from {}", path.display());
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(YamlConfig::default());
        }
        return serde_yaml::from_str(&content).map_err(|e| {
            AppError::Config(format!("failed to parse {}: {}", path.display(), e))
        });
    }
    debug!("No config file found, using defaults");
    Ok(YamlConfig::default())
}

/// Values given on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub registry: Option<String>,
    pub secret_name: Option<String>,
    pub secret_namespace: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub organisation: Option<String>,
}

/// Fully resolved settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub registry_url: String,
    pub secret_name: String,
    pub secret_namespace: String,
    pub kubeconfig: Option<PathBuf>,
    pub organisation: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// `$KUBECONFIG` style values in the file are placeholders, not paths
fn kubeconfig_from_file(value: &str) -> Option<PathBuf> {
    non_empty(Some(value.to_string()))
        .filter(|v| !v.trim_start().starts_with('$'))
        .map(PathBuf::from)
}

fn or_file(value: Option<String>, file: &str) -> String {
    non_empty(value).unwrap_or_else(|| file.to_string())
}

impl Settings {
    /// Command line/environment first, then the config file, then defaults.
    pub fn resolve(overrides: Overrides, file: &YamlConfig, home: Option<&Path>) -> Self {
        let registry_url = or_file(overrides.registry, &file.registry.url);
        let registry_url = registry_url
            .strip_suffix('/')
            .unwrap_or(&registry_url)
            .to_string();

        let organisation = non_empty(overrides.organisation)
            .or_else(|| non_empty(Some(file.organisation.clone())))
            .filter(|o| o != NO_ORGANISATION);

        let kubeconfig = overrides
            .kubeconfig
            .filter(|p| !p.as_os_str().is_empty())
            .or_else(|| kubeconfig_from_file(&file.registry.kubeconfig_path))
            .or_else(|| home.map(|h| h.join(".kube").join("config")));

        Self {
            registry_url,
            secret_name: or_file(overrides.secret_name, &file.registry.secret_name),
            secret_namespace: or_file(overrides.secret_namespace, &file.registry.secret_namespace),
            kubeconfig,
            organisation,
        }
    }

    /// Search the usual locations for a config file and resolve against it
    pub fn load(overrides: Overrides) -> Result<Self, AppError> {
        let file = load_yaml_config(&search_paths())?;
        Ok(Self::resolve(overrides, &file, dirs::home_dir().as_deref()))
    }

    pub fn require_organisation(&self) -> Result<&str, AppError> {
        self.organisation.as_deref().ok_or_else(|| {
            AppError::Config(
                "no organisation given (use --organisation, QUAYDEFAULTORG or config.yaml)"
                    .to_string(),
            )
        })
    }

    pub fn to_yaml_config(&self) -> YamlConfig {
        YamlConfig {
            registry: RegistrySection {
                url: self.registry_url.clone(),
                kubeconfig_path: self
                    .kubeconfig
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                secret_name: self.secret_name.clone(),
                secret_namespace: self.secret_namespace.clone(),
            },
            organisation: self
                .organisation
                .clone()
                .unwrap_or_else(|| NO_ORGANISATION.to_string()),
        }
    }
}

pub fn write_config(path: &Path, config: &YamlConfig) -> Result<(), AppError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, serde_yaml::to_string(config)?)?;
    Ok(())
}

/// Write `config` to ~/.config/qc/config.yaml and return the path
pub fn save_config_file(config: &YamlConfig) -> Result<PathBuf, AppError> {
    let home = dirs::home_dir()
        .ok_or_else(|| AppError::Config("cannot determine home directory".to_string()))?;
    let path = home.join(".config").join(APP_DIR).join(CONFIG_FILE);
    write_config(&path, config)?;
    info!("Config file created at {}", path.display());
    Ok(path)
}
