use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::Overrides;
use crate::output::OutputFormat;
use crate::severity::Severity;

/// qc: Quay registry client for tags, vulnerabilities and cleanup plans
#[derive(Parser, Debug)]
#[command(name = "qc", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Registry URL (e.g., https://quay.example.com)
    #[arg(short = 'u', long, global = true, env = "QUAYREGISTRY")]
    pub registry: Option<String>,

    /// Name of the Kubernetes secret holding the registry credentials
    #[arg(short, long, global = true, env = "QUAYREGISTRYADMINSECRET")]
    pub secret: Option<String>,

    /// Namespace of the credentials secret
    #[arg(long, global = true, env = "QUAYREGISTRYSECRETNAMESPACE")]
    pub secret_namespace: Option<String>,

    /// Path to the kubeconfig used to read the secret
    #[arg(long, global = true, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Organisation to operate on ("-" for none)
    #[arg(short, long, global = true, env = "QUAYDEFAULTORG")]
    pub organisation: Option<String>,

    /// Username for basic auth (skips the secret lookup together with --password)
    #[arg(long, global = true, env = "QUAYUSER")]
    pub username: Option<String>,

    /// Password for basic auth
    #[arg(long, global = true, env = "QUAYPASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Yaml)]
    pub format: OutputFormat,

    /// Indent JSON output
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Write output to this file instead of stdout
    #[arg(long, global = true)]
    pub output_file: Option<PathBuf>,

    /// Maximum number of concurrent registry requests
    #[arg(long, global = true, default_value_t = 10)]
    pub concurrency: usize,

    /// Give up on outstanding tag/repository lookups after this many seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Verbose output
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,
}

impl GlobalArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            registry: self.registry.clone(),
            secret_name: self.secret.clone(),
            secret_namespace: self.secret_namespace.clone(),
            kubeconfig: self.kubeconfig.clone(),
            organisation: self.organisation.clone(),
        }
    }

    pub fn explicit_credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List all organisations (superuser)
    Orgs,
    /// List the repositories of the organisation
    Repos(ReposArgs),
    /// List the tags of a repository with their vulnerabilities
    Tags(TagsArgs),
    /// Delete a tag
    Delete(DeleteArgs),
    /// Print commands deleting unused, old or vulnerable tags
    PlanDeletions(PlanArgs),
    /// List the default permission prototypes (users) of the organisation
    Users,
    /// List repository notifications of the organisation
    Notifications,
    /// Print a curl command for the registry API
    Curl,
    /// Write ~/.config/qc/config.yaml
    InitConfig(InitConfigArgs),
}

#[derive(Args, Debug)]
pub struct ReposArgs {
    /// Only repositories whose name matches this regex
    #[arg(long)]
    pub regex: Option<String>,

    /// Include tags with vulnerability summaries (youngest tag only, unless --tag is given)
    #[arg(short, long, default_value_t = false)]
    pub details: bool,

    /// Only tags whose name matches this regex
    #[arg(short, long)]
    pub tag: Option<String>,
}

#[derive(Args, Debug)]
pub struct TagsArgs {
    /// Repository name
    #[arg(short, long)]
    pub repository: String,

    /// Only tags whose name matches this regex
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Only findings at or above this severity
    #[arg(long, value_enum)]
    pub severity: Option<Severity>,

    /// Only findings of features with a base score above this
    #[arg(long, default_value_t = 0.0)]
    pub basescore: f64,

    /// Include vulnerability details
    #[arg(short, long, default_value_t = false)]
    pub details: bool,

    /// Keep tags whose scan has not completed
    #[arg(long, default_value_t = false)]
    pub include_unscanned: bool,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Repository name
    #[arg(short, long)]
    pub repository: String,

    /// Tag to delete
    #[arg(short, long)]
    pub tag: String,
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Only repositories whose name matches this regex
    #[arg(long, default_value = "")]
    pub repo_regex: String,

    /// Only tags whose name matches this regex
    #[arg(long, default_value = "")]
    pub tag_regex: String,

    /// Only tags whose highest severity is at least this
    #[arg(long, value_enum)]
    pub severity: Option<Severity>,

    /// Only tags at least this many days old
    #[arg(long, default_value_t = 0)]
    pub min_age: u64,
}

#[derive(Args, Debug)]
pub struct InitConfigArgs {
    /// Write the example template instead of the current settings
    #[arg(long, default_value_t = false)]
    pub example: bool,
}
