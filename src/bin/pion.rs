//! pion CLI - plays declarative HTTP test calls.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use pion::{
    api_client::ReqwestDispatcher,
    provision::{DefinitionStoreLoader, ProvisionConfig, ProvisionReport},
    Player, PlayerConfig, ScenarioResult, StaticIdentityProvider, TestDataStore,
};
use serde_json::Value;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Plays HTTP test calls defined in `*.td.json` / `*.td.yaml` files.
#[derive(Parser, Debug)]
#[command(name = "pion", version, about)]
struct Cli {
    /// Test data directory (repeatable).
    #[arg(short = 'p', long = "path", default_value = "test-data")]
    paths: Vec<PathBuf>,

    /// Run only scenarios whose guid contains this text.
    #[arg(short = 'f', long = "filter")]
    filter: Option<String>,

    /// Base URL for relative URIs.
    #[arg(short = 'b', long = "base-url", env = "TEST_URL")]
    base_url: Option<String>,

    /// Timeout in seconds per call.
    #[arg(short = 't', long = "timeout", default_value_t = 30)]
    timeout: u64,

    /// Users file mapping usernames to access tokens.
    #[arg(short = 'u', long = "users", env = "PION_USERS_FILE")]
    users: Option<PathBuf>,

    /// Custom value exposed to references, as `key=value` (repeatable).
    #[arg(long = "set", value_parser = parse_custom_value)]
    custom_values: Vec<(String, String)>,

    /// Stop at the first failing scenario.
    #[arg(long = "fail-fast")]
    fail_fast: bool,

    /// Directory to save report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Also run definitions that other definitions use as
    /// prerequisites.
    #[arg(long = "include-prerequisites")]
    include_prerequisites: bool,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add user roles and import definition files into the
    /// definition store.
    Provision {
        /// Provisioning file: store URL, importer user, roles and
        /// definitions directory.
        #[arg(short = 'c', long = "config", env = "PION_PROVISION_FILE")]
        config: PathBuf,

        #[arg(long = "skip-roles")]
        skip_roles: bool,

        #[arg(long = "skip-definitions")]
        skip_definitions: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

fn parse_custom_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

fn print_result(result: &ScenarioResult) {
    let status = if result.success {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!("{} scenario: {} ({} ms)", status, result.name, result.duration_ms);

    for (i, call) in result.calls.iter().enumerate() {
        let mark = if call.success {
            "\x1b[32m✓\x1b[0m"
        } else {
            "\x1b[31m✗\x1b[0m"
        };
        info!(
            "  {}. {} {} [{}] ({} ms)",
            i + 1,
            mark,
            call.context,
            call.guid,
            call.duration_ms
        );
        if let Some(err) = &call.error {
            error!("     \x1b[31mError: {}\x1b[0m", err);
        }
        for diff in &call.diffs {
            error!("     \x1b[31m{}\x1b[0m", diff);
        }
    }
}

fn save_report(result: &ScenarioResult, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = result.name.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized_name}-{timestamp}.json"),
            serde_json::to_string_pretty(result)?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized_name}-{timestamp}.yaml"),
            serde_yaml::to_string(result)?,
        ),
        ReportFormat::Text => {
            let mut content = String::new();
            content.push_str(&format!("Scenario: {}\n", result.name));
            content.push_str(&format!(
                "Status: {}\n",
                if result.success { "PASS" } else { "FAIL" }
            ));
            if let Some(err) = &result.error {
                content.push_str(&format!("Error: {err}\n"));
            }
            content.push_str(&format!("Duration: {} ms\n\nCalls:\n", result.duration_ms));
            for (i, call) in result.calls.iter().enumerate() {
                content.push_str(&format!(
                    "  {}. {} [{}] ({})\n",
                    i + 1,
                    call.context,
                    call.guid,
                    if call.success { "PASS" } else { "FAIL" }
                ));
                if let Some(err) = &call.error {
                    content.push_str(&format!("     Error: {err}\n"));
                }
                for diff in &call.diffs {
                    content.push_str(&format!("     {diff}\n"));
                }
            }
            (format!("{sanitized_name}-{timestamp}.txt"), content)
        }
    };

    let file_path = report_dir.join(filename);
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;
    Ok(file_path)
}

fn load_store(paths: &[PathBuf]) -> Result<TestDataStore> {
    let mut store = TestDataStore::new();
    for path in paths {
        if !path.is_dir() {
            return Err(anyhow!("Not a directory: {}", path.display()));
        }
        store.load_dir(path)?;
    }
    if store.is_empty() {
        return Err(anyhow!("No test data found"));
    }
    Ok(store)
}

fn print_provision_report(step: &str, report: &ProvisionReport) {
    info!(
        "{}: {} succeeded, {} failed",
        step,
        report.succeeded.len(),
        report.failed.len()
    );
    for (item, err) in &report.failed {
        error!("  \x1b[31m{}: {}\x1b[0m", item, err);
    }
}

async fn provision(
    path: &Path,
    identity: StaticIdentityProvider,
    timeout: Duration,
    skip_roles: bool,
    skip_definitions: bool,
) -> Result<bool> {
    let config = ProvisionConfig::from_file(path)?;
    let loader = DefinitionStoreLoader::new(&config, Arc::new(identity), timeout);
    let mut success = true;

    if !skip_roles {
        let report = loader.add_roles(&config.roles).await;
        print_provision_report("Roles", &report);
        success &= report.success();
    }
    if !skip_definitions {
        match &config.definitions_dir {
            Some(dir) => {
                let report = loader.import_definitions(dir).await?;
                print_provision_report("Definitions", &report);
                success &= report.success();
            }
            None => info!("No definitions directory configured, skipping imports"),
        }
    }
    Ok(success)
}

fn load_identity(users: Option<&Path>) -> Result<StaticIdentityProvider> {
    match users {
        Some(path) => StaticIdentityProvider::from_file(path)
            .context(format!("Failed to load users from {}", path.display())),
        None => Ok(StaticIdentityProvider::new()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.verbose);

    if let Some(Command::Provision {
        config,
        skip_roles,
        skip_definitions,
    }) = &args.command
    {
        let identity = load_identity(args.users.as_deref())?;
        let timeout = Duration::from_secs(args.timeout);
        if !provision(config, identity, timeout, *skip_roles, *skip_definitions).await? {
            exit(1);
        }
        return Ok(());
    }

    let config = PlayerConfig {
        base_url: args.base_url.clone(),
        timeout: Duration::from_secs(args.timeout),
        continue_on_failure: !args.fail_fast,
    };
    debug!("Player config: {:?}", config);

    let store = load_store(&args.paths)?;
    let identity = load_identity(args.users.as_deref())?;

    let mut player = Player::new(
        Arc::new(ReqwestDispatcher::new(config.base_url.clone(), config.timeout)),
        Arc::new(identity),
    );
    for (key, value) in args.custom_values {
        player = player.with_custom_value(key, Value::String(value));
    }

    let candidates: Vec<&str> = if args.include_prerequisites {
        store.guids().collect()
    } else {
        store.scenario_guids()
    };
    let guids: Vec<String> = candidates
        .into_iter()
        .filter(|guid| args.filter.as_deref().is_none_or(|f| guid.contains(f)))
        .map(str::to_string)
        .collect();
    if guids.is_empty() {
        return Err(anyhow!("No scenarios matching the filter were found"));
    }

    info!("Running {} scenario(s)...", guids.len());
    let total_start = Instant::now();
    let (mut passed, mut failed) = (0, 0);

    for guid in &guids {
        let result = player.run(&store, guid).await?;
        print_result(&result);

        if let Some(dir) = &args.report_dir {
            match save_report(&result, dir, args.report_format) {
                Ok(path) => info!("Report saved: {}", path.display()),
                Err(e) => error!("Failed to save report: {}", e),
            }
        }

        if result.success {
            passed += 1;
        } else {
            failed += 1;
            if !config.continue_on_failure {
                info!("Stopping due to scenario failure");
                break;
            }
        }
    }

    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Duration: {} ms",
        passed + failed,
        passed,
        failed,
        total_start.elapsed().as_millis()
    );

    if failed > 0 {
        exit(1);
    }
    Ok(())
}
