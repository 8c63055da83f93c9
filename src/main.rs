mod auth;
mod cli;
mod config;
mod error;
mod filter;
mod models;
mod operations;
mod output;
mod planner;
mod registry;
mod severity;
mod usage;
mod vulnerability;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use auth::AuthScheme;
use cli::{Cli, Command, GlobalArgs};
use config::{save_config_file, Settings, YamlConfig};
use error::AppError;
use filter::VulnerabilityFilter;
use models::{OrgSet, TagResults};
use operations::{Operations, RepositoryQuery, TagQuery, UnscannedPolicy};
use output::{notifications_table, org_list, tags_table, users_table, Renderer};
use planner::{plan_deletions, write_plan, DeletionCriteria};
use registry::RegistryClient;
use usage::ImageToolReport;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "qc=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    let settings = Settings::load(cli.global.overrides()).context("failed to load configuration")?;
    debug!("Resolved settings: {:?}", settings);

    let renderer = Renderer::new(
        cli.global.format,
        cli.global.pretty,
        cli.global.output_file.clone(),
    );

    if let Command::InitConfig(args) = &cli.command {
        let config = if args.example || settings.registry_url.is_empty() {
            YamlConfig::example()
        } else {
            settings.to_yaml_config()
        };
        let path = save_config_file(&config)?;
        println!("Config file created successfully in path: {}", path.display());
        return Ok(());
    }

    let auth = resolve_auth(&cli.global, &settings).await?;
    let client = Arc::new(
        RegistryClient::new(&settings.registry_url, Some(auth), cli.global.concurrency)
            .context("failed to create registry client")?,
    );
    debug!("Using registry API at {}", client.base_url());
    let ops = Operations::new(client.clone());
    if let Some(secs) = cli.global.timeout {
        ops.cancel_after(Duration::from_secs(secs));
    }

    match cli.command {
        Command::Orgs => {
            let orgs = ops
                .list_organizations()
                .await
                .context("failed to list organizations")?;
            renderer.emit(&orgs, org_list)?;
        }
        Command::Repos(args) => {
            let org = settings.require_organisation()?;
            let query = RepositoryQuery::new(args.details, args.tag.clone());
            let orgs = match &args.regex {
                Some(pattern) => ops.list_repositories_by_pattern(org, pattern, &query).await,
                None => ops.list_organization_repositories(org, &query).await,
            }
            .with_context(|| format!("failed to list repositories of {}", org))?;

            if query.details {
                let headline = if query.only_youngest {
                    format!(
                        "Overview - From every repo of org: {}, the youngest tag of each repo.",
                        org
                    )
                } else {
                    format!("Overview - Matching tags of every repo of org: {}", org)
                };
                renderer.emit(&orgs, |o: &OrgSet| {
                    let tags: Vec<_> = o
                        .organizations
                        .iter()
                        .flat_map(|org| &org.repositories)
                        .flat_map(|repo| repo.tags.iter().cloned())
                        .collect();
                    tags_table(&tags, &headline, true)
                })?;
            } else {
                renderer.emit(&orgs, org_list)?;
            }
        }
        Command::Tags(args) => {
            let org = settings.require_organisation()?;
            let policy = if args.include_unscanned {
                UnscannedPolicy::Include
            } else {
                UnscannedPolicy::Skip
            };
            let ops = ops.with_unscanned_policy(policy);
            let query = TagQuery {
                tag_pattern: args.tag.clone(),
                filter: VulnerabilityFilter::new(args.severity, args.basescore),
                details: args.details,
                only_youngest: false,
            };
            let results = ops
                .list_repository_tags(org, &args.repository, &query)
                .await
                .with_context(|| format!("failed to list tags of {}/{}", org, args.repository))?;
            if !results.skipped.is_empty() {
                info!(
                    "{} tag(s) of {}/{} left out",
                    results.skipped.len(),
                    org,
                    args.repository
                );
                for skipped in &results.skipped {
                    debug!("  {}: {}", skipped.name, skipped.reason);
                }
            }

            let headline = format!("Tags of {}/{}", org, args.repository);
            renderer.emit(&results, |r: &TagResults| {
                tags_table(&r.tags, &headline, false)
            })?;
        }
        Command::Delete(args) => {
            let org = settings.require_organisation()?;
            ops.delete_tag(org, &args.repository, &args.tag)
                .await
                .context("failed to delete tag")?;
            println!(
                "Successfully deleted tag {} from {}/{}",
                args.tag, org, args.repository
            );
        }
        Command::PlanDeletions(args) => {
            let org = settings.require_organisation()?;
            let criteria = DeletionCriteria::new(
                &args.repo_regex,
                &args.tag_regex,
                args.severity,
                args.min_age,
            )
            .context("invalid deletion pattern")?;
            let usage = ImageToolReport::load(org)
                .await
                .context("failed to load image usage report")?;
            let plan = plan_deletions(&ops, org, &settings.registry_url, &criteria, &usage)
                .await
                .context("failed to plan deletions")?;

            let mut script = Vec::new();
            write_plan(&plan, &mut script)?;
            renderer.write_raw(&String::from_utf8_lossy(&script))?;
        }
        Command::Users => {
            let org = settings.require_organisation()?;
            let users = ops
                .get_users(org)
                .await
                .context("failed to get users")?;
            renderer.emit(&users, users_table)?;
        }
        Command::Notifications => {
            let org = settings.require_organisation()?;
            let notifications = ops
                .list_notifications(org)
                .await
                .context("failed to list notifications")?;
            renderer.emit(&notifications, notifications_table)?;
        }
        Command::Curl => match client.curl_command(&settings.registry_url) {
            Some(line) => println!("{}", line),
            None => println!("No Bearer token found in the provided secret."),
        },
        Command::InitConfig(_) => {}
    }

    Ok(())
}

/// Explicit username/password, else the configured Kubernetes secret
async fn resolve_auth(global: &GlobalArgs, settings: &Settings) -> Result<AuthScheme> {
    if let Some(scheme) = AuthScheme::resolve(global.explicit_credentials(), None) {
        return Ok(scheme);
    }
    if settings.secret_name.is_empty() || settings.secret_namespace.is_empty() {
        return Err(AppError::Credentials(
            "no credentials configured (use --username/--password or a secret name and namespace)"
                .to_string(),
        )
        .into());
    }

    let credential = auth::load_secret(
        &settings.secret_name,
        &settings.secret_namespace,
        settings.kubeconfig.as_deref(),
    )
    .await
    .context("failed to read registry credentials")?;
    debug!("Loaded credential {:?}", credential);

    AuthScheme::resolve(None, Some(&credential)).ok_or_else(|| {
        AppError::Credentials("secret contains no usable credentials".to_string()).into()
    })
}
