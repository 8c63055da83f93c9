use std::collections::HashMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::AppError;

const DOCKER_CONFIG_SECRET: &str = "kubernetes.io/dockerconfigjson";
const OPAQUE_SECRET: &str = "Opaque";

/// Credential resolved from a secret
#[derive(Clone, PartialEq)]
pub enum Credential {
    Bearer(String),
    Basic { username: String, password: String },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Bearer(_) => write!(f, "Bearer(***)"),
            Credential::Basic { username, .. } => write!(f, "Basic({}:***)", username),
        }
    }
}

/// The single authentication scheme attached to every request
#[derive(Debug, Clone, PartialEq)]
pub enum AuthScheme {
    Bearer(String),
    Basic { username: String, password: String },
}

impl AuthScheme {
    /// Explicit username+password > bearer token > credential username+password.
    pub fn resolve(
        explicit: Option<(&str, &str)>,
        credential: Option<&Credential>,
    ) -> Option<AuthScheme> {
        if let Some((username, password)) = explicit {
            if !username.is_empty() && !password.is_empty() {
                return Some(AuthScheme::Basic {
                    username: username.to_string(),
                    password: password.to_string(),
                });
            }
        }
        match credential? {
            Credential::Bearer(token) if !token.is_empty() => {
                Some(AuthScheme::Bearer(token.clone()))
            }
            Credential::Basic { username, password }
                if !username.is_empty() && !password.is_empty() =>
            {
                Some(AuthScheme::Basic {
                    username: username.clone(),
                    password: password.clone(),
                })
            }
            _ => None,
        }
    }

    pub fn bearer_token(&self) -> Option<&str> {
        match self {
            AuthScheme::Bearer(token) => Some(token),
            AuthScheme::Basic { .. } => None,
        }
    }
}

/// `kubectl get secret -o json` output, reduced to what we read
#[derive(Debug, Deserialize)]
pub struct KubeSecret {
    #[serde(rename = "type", default)]
    pub secret_type: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl KubeSecret {
    fn field(&self, key: &str) -> Result<Option<String>, AppError> {
        match self.data.get(key) {
            Some(value) => {
                let decoded = STANDARD.decode(value.trim()).map_err(|e| {
                    AppError::Credentials(format!("secret field '{}' is not base64: {}", key, e))
                })?;
                Ok(Some(String::from_utf8_lossy(&decoded).into_owned()))
            }
            None => Ok(None),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Debug, Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
}

/// Extract a credential from a docker-config or opaque secret
pub fn parse_secret(secret: &KubeSecret) -> Result<Credential, AppError> {
    match secret.secret_type.as_str() {
        DOCKER_CONFIG_SECRET => parse_docker_config(secret),
        OPAQUE_SECRET => parse_opaque(secret),
        other => Err(AppError::Credentials(format!(
            "unsupported secret type: {}",
            other
        ))),
    }
}

fn parse_docker_config(secret: &KubeSecret) -> Result<Credential, AppError> {
    let raw = secret.field(".dockerconfigjson")?.ok_or_else(|| {
        AppError::Credentials("docker config secret has no .dockerconfigjson".to_string())
    })?;
    let config: DockerConfig = serde_json::from_str(&raw)
        .map_err(|e| AppError::Credentials(format!("invalid docker config json: {}", e)))?;

    // Map order is unspecified; sort so the same secret always yields the same entry.
    let mut registries: Vec<_> = config.auths.iter().collect();
    registries.sort_by(|a, b| a.0.cmp(b.0));

    for (registry, entry) in registries {
        let Some(auth) = entry.auth.as_deref() else {
            continue;
        };
        let Ok(decoded) = STANDARD.decode(auth) else {
            debug!("Skipping undecodable auth entry for {}", registry);
            continue;
        };
        let decoded = String::from_utf8_lossy(&decoded);
        if let Some((username, password)) = decoded.split_once(':') {
            return Ok(Credential::Basic {
                username: username.to_string(),
                password: password.to_string(),
            });
        }
    }
    Err(AppError::Credentials(
        "no valid credentials found in docker config".to_string(),
    ))
}

fn parse_opaque(secret: &KubeSecret) -> Result<Credential, AppError> {
    if let Some(token) = secret.field("token")? {
        return Ok(Credential::Bearer(token));
    }
    if let Some(auth) = secret.field("auth")? {
        return Ok(Credential::Bearer(auth));
    }
    if let (Some(username), Some(password)) =
        (secret.field("username")?, secret.field("password")?)
    {
        return Ok(Credential::Basic { username, password });
    }
    Err(AppError::Credentials(
        "no valid credentials found in opaque secret".to_string(),
    ))
}

/// Read a secret through kubectl and parse it
pub async fn load_secret(
    name: &str,
    namespace: &str,
    kubeconfig: Option<&Path>,
) -> Result<Credential, AppError> {
    let mut cmd = Command::new("kubectl");
    cmd.args(["get", "secret", name, "-n", namespace, "-o", "json"]);
    if let Some(path) = kubeconfig {
        cmd.arg("--kubeconfig").arg(path);
    }
    debug!("Reading secret {}/{} via kubectl", namespace, name);

    let output = cmd
        .output()
        .await
        .map_err(|e| AppError::Credentials(format!("failed to run kubectl: {}", e)))?;
    if !output.status.success() {
        return Err(AppError::Credentials(format!(
            "failed to get secret {}/{}: {}",
            namespace,
            name,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let secret: KubeSecret = serde_json::from_slice(&output.stdout)
        .map_err(|e| AppError::Credentials(format!("invalid secret json: {}", e)))?;
    parse_secret(&secret)
}
