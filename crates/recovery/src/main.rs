//! Recovery monitor CLI
//!
//! Watches DolphinScheduler for failed workflow instances and resumes the
//! ones whose failed tasks have used up their retries.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Confirm};
use notify::{
    DingTalkChannel, DingTalkSettings, EmailChannel, EmailSettings, Notifier, NotifyChannel,
    RateLimiter, WeWorkChannel,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use recovery::config::{LogFormat, DEFAULT_CONFIG_PATH};
use recovery::gateway::ProjectScope;
use recovery::types::{Project, TimeWindow};
use recovery::{
    validate, Config, DolphinClient, Monitor, MonitorOptions, Outcome, PolicyEngine,
    RecoveryStore, SchedulerGateway,
};

/// Failure recovery monitor for DolphinScheduler workflows
#[derive(Parser)]
#[command(name = "recovery-monitor")]
#[command(about = "Failure recovery monitor for DolphinScheduler workflows")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the YAML config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true, env = "DS_CONFIG")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// [PRIMARY] Monitor configured projects and recover failed instances
    Run,
    /// Run exactly one check cycle
    Check,
    /// Verify the API URL and token by listing projects
    TestConnection,
    /// List recent failed instances per workflow definition
    ListWorkflows {
        /// Project name
        #[arg(long)]
        project: String,

        /// Only this workflow definition
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Validate one instance and print the verdict
    Validate {
        #[arg(long)]
        project: String,

        #[arg(long)]
        instance_id: u64,
    },
    /// Run the recovery policy for one instance
    Recover {
        #[arg(long)]
        project: String,

        #[arg(long)]
        instance_id: u64,

        /// Resume without validation or policy checks
        #[arg(long)]
        force: bool,
    },
    /// Show recovery history statistics
    Stats,
    /// Clear recovery records
    ClearRecords {
        /// Only this instance (default: all records)
        #[arg(long)]
        instance_id: Option<u64>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Print the effective configuration with secrets masked
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    init_tracing(&config, cli.verbose)?;

    match cli.command {
        Commands::Run => run(&config, false).await,
        Commands::Check => run(&config, true).await,
        Commands::TestConnection => test_connection(&config).await,
        Commands::ListWorkflows { project, workflow } => {
            list_workflows(&config, &project, workflow.as_deref()).await
        }
        Commands::Validate {
            project,
            instance_id,
        } => validate_instance(&config, &project, instance_id).await,
        Commands::Recover {
            project,
            instance_id,
            force,
        } => recover(&config, &project, instance_id, force).await,
        Commands::Stats => stats(&config).await,
        Commands::ClearRecords { instance_id, yes } => {
            clear_records(&config, instance_id, yes).await
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            Ok(())
        }
    }
}

/// `show-config` must work with an incomplete config, everything else validates.
fn load_config(cli: &Cli) -> Result<Config> {
    if matches!(cli.command, Commands::ShowConfig) {
        let mut config = Config::from_file(&cli.config)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        return Ok(config);
    }
    Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };

    let registry = tracing_subscriber::registry().with(filter);
    let initialized = match config.logging.format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).try_init(),
    };
    initialized.context("Failed to initialize tracing")
}

fn build_notifier(config: &Config) -> Result<Notifier> {
    let section = &config.notification;
    let email = &section.email;
    let channels: Vec<Arc<dyn NotifyChannel>> = vec![
        Arc::new(DingTalkChannel::new(DingTalkSettings {
            webhook_url: section.dingtalk.webhook_url.clone(),
            keyword: section.dingtalk.keyword.clone(),
            secret: section.dingtalk.secret.clone(),
            at_mobiles: section.dingtalk.at_mobiles.clone(),
            at_all: section.dingtalk.at_all,
        })),
        Arc::new(
            WeWorkChannel::new(section.wework.webhook_url.clone()).with_mentions(
                section.wework.mentioned_list.clone(),
                section.wework.mentioned_mobile_list.clone(),
            ),
        ),
        Arc::new(EmailChannel::new(EmailSettings {
            enabled: email.enabled,
            smtp_host: email.smtp_host.clone(),
            smtp_port: email.smtp_port,
            username: email.username.clone(),
            password: email.password.clone(),
            from_addr: email.from_addr.clone(),
            to_addrs: email.to_addrs.clone(),
            use_ssl: email.use_ssl,
        })),
    ];

    let notifier = Notifier::with_channels(channels);
    if section.rate_limit.max_notifications == 0 {
        return Ok(notifier);
    }

    let limiter = RateLimiter::open(
        &section.rate_limit.path,
        section.rate_limit.max_notifications,
        section.rate_limit.window_hours,
    )
    .context("Failed to open notification rate limit state")?;
    Ok(notifier.with_rate_limit(limiter))
}

fn client(config: &Config) -> Result<DolphinClient> {
    DolphinClient::new(config.dolphin()).context("Failed to create scheduler client")
}

async fn open_store(config: &Config) -> Result<Arc<RecoveryStore>> {
    let store = RecoveryStore::open(&config.state.path)
        .await
        .with_context(|| format!("Failed to open state file {}", config.state.path.display()))?;
    Ok(Arc::new(store))
}

async fn build_monitor(config: &Config) -> Result<Monitor<DolphinClient>> {
    let store = open_store(config).await?;
    Ok(Monitor::new(
        Arc::new(client(config)?),
        PolicyEngine::new(store, config.policy()),
        Arc::new(build_notifier(config)?),
        MonitorOptions::from_config(config),
        config.project_list(),
    ))
}

async fn find_project(gateway: &DolphinClient, name: &str) -> Result<Project> {
    gateway
        .list_projects()
        .await
        .context("Failed to list projects")?
        .into_iter()
        .find(|p| p.name == name)
        .with_context(|| format!("Project '{name}' not found"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}

async fn run(config: &Config, single: bool) -> Result<()> {
    let mut config = config.clone();
    if single {
        config.monitor.continuous_mode = false;
    }

    let mut monitor = build_monitor(&config).await?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    let stats = monitor.run(shutdown).await?;

    println!(
        "{} cycles={} checked={} recovered={} failed={} notify_only={} errors={}",
        "Monitor finished:".cyan().bold(),
        stats.cycles,
        stats.instances_checked,
        stats.recoveries_triggered,
        stats.recoveries_failed,
        stats.notify_only,
        stats.errors
    );
    Ok(())
}

async fn test_connection(config: &Config) -> Result<()> {
    let gateway = client(config)?;
    println!("Connecting to {}", config.dolphinscheduler.api_url);

    let projects = gateway
        .list_projects()
        .await
        .context("Connection test failed")?;

    println!("{}", "Connection OK".green().bold());
    println!("Projects visible to this token: {}", projects.len());
    for project in projects {
        println!("  {} ({})", project.name, project.code);
    }
    Ok(())
}

async fn list_workflows(config: &Config, project: &str, workflow: Option<&str>) -> Result<()> {
    let gateway = client(config)?;
    let found = find_project(&gateway, project).await?;
    let window = TimeWindow::ending_at(Utc::now(), config.monitor.time_window_hours);

    let definitions = gateway
        .list_definitions(found.code)
        .await
        .context("Failed to list workflow definitions")?;

    for definition in definitions
        .iter()
        .filter(|d| workflow.map_or(true, |w| w == d.name))
    {
        let failed = gateway
            .list_instances(found.code, Some(definition.code), window)
            .await
            .with_context(|| format!("Failed to list instances of {}", definition.name))?;

        println!(
            "{} ({}) - {} failed in the last {}h",
            definition.name.bold(),
            definition.code,
            failed.len(),
            config.monitor.time_window_hours
        );
        for instance in failed {
            let started = instance
                .started_at
                .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
            println!("  #{} {} started {}", instance.id, instance.status.red(), started);
        }
    }
    Ok(())
}

async fn validate_instance(config: &Config, project: &str, instance_id: u64) -> Result<()> {
    let gateway = client(config)?;
    let found = find_project(&gateway, project).await?;

    let instance = gateway
        .get_instance(found.code, instance_id)
        .await
        .with_context(|| format!("Failed to fetch instance {instance_id}"))?;
    let source = ProjectScope::new(&gateway, found.code);
    let verdict = validate(&instance, &source, config.monitor.max_depth).await?;

    let status = if verdict.recoverable {
        "RECOVERABLE".green().bold()
    } else {
        "NOT RECOVERABLE".yellow().bold()
    };
    println!("{} #{}: {status}", instance.name, instance.id);
    println!("Reason: {}", verdict.reason);
    println!(
        "Tasks: {} total, {} done, {} failed, {} in progress ({} instances)",
        verdict.tally.total,
        verdict.tally.done,
        verdict.tally.failed,
        verdict.tally.in_progress,
        verdict.instances_checked
    );
    for entry in &verdict.unmet {
        println!("  - instance {}: {}", entry.instance_id, entry.condition);
    }
    Ok(())
}

async fn recover(config: &Config, project: &str, instance_id: u64, force: bool) -> Result<()> {
    if force {
        let gateway = client(config)?;
        let found = find_project(&gateway, project).await?;
        warn!(instance_id, "Forcing resume without validation");
        gateway
            .resume_instance(found.code, instance_id)
            .await
            .with_context(|| format!("Failed to resume instance {instance_id}"))?;
        println!("{}", format!("Resume requested for #{instance_id}").green());
        return Ok(());
    }

    let gateway = client(config)?;
    let found = find_project(&gateway, project).await?;
    let monitor = build_monitor(config).await?;

    let report = monitor
        .evaluate(project, found.code, instance_id, None)
        .await;
    monitor.notifier().shutdown().await;
    let report = report?;

    match &report.outcome {
        Outcome::Recovered { attempt } => println!(
            "{}",
            format!("Recovery triggered for #{instance_id} (attempt {attempt})").green()
        ),
        Outcome::ResumeFailed { error, .. } => {
            println!("{}", format!("Resume failed: {error}").red());
        }
        Outcome::NotifyOnly { reason } => {
            println!("{}", format!("Manual intervention required: {reason}").yellow());
        }
        Outcome::Skipped { reason } => println!("Skipped: {reason}"),
        Outcome::Errored { error } => println!("{}", format!("Error: {error}").red()),
    }
    Ok(())
}

async fn stats(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let stats = store.statistics().await;

    println!("{}", "Recovery statistics".cyan().bold());
    println!("State file:          {}", store.path().display());
    println!("Tracked instances:   {}", stats.tracked_instances);
    println!("Total attempts:      {}", stats.total_attempts);
    println!("Successful resumes:  {}", stats.successful_resumes);
    println!("Awaiting operator:   {}", stats.instances_notify_only);
    if let Some(updated) = stats.last_updated {
        println!("Last update:         {}", updated.to_rfc3339());
    }

    for (id, record) in store.records().await {
        println!(
            "  #{id} {} attempts={}/{} failures_in_window={} last={:?}",
            record.workflow_name,
            record.attempt_count,
            config.retry.max_recovery_attempts,
            record.window_failure_count,
            record.last_decision
        );
    }
    Ok(())
}

async fn clear_records(config: &Config, instance_id: Option<u64>, yes: bool) -> Result<()> {
    let store = open_store(config).await?;

    if !yes && !confirm_clear(store.path(), instance_id)? {
        println!("Aborted");
        return Ok(());
    }

    let removed = store.clear(instance_id).await?;
    println!("{}", format!("Removed {removed} record(s)").green());
    Ok(())
}

fn confirm_clear(path: &Path, instance_id: Option<u64>) -> Result<bool> {
    let prompt = match instance_id {
        Some(id) => format!("Clear recovery record for #{id} in {}?", path.display()),
        None => format!("Clear ALL recovery records in {}?", path.display()),
    };
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}
