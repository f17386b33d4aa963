//! nfse-harvest: entry point.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use nfse_harvest::{today_in, HarvestConfig, Period, SourceConfig, TenantId};
use nfse_harvest_cli::{
    diagnose, ensure_data_dir, render_consolidation, render_summary, Backend, BackendOptions,
    Backends, TuningArgs,
};

#[derive(Parser)]
#[command(
    name = "nfse-harvest",
    about = "Incremental NFS-e harvester: pulls documents by NSU, stores them once and archives each month",
    version
)]
struct Cli {
    /// Storage backend.
    #[arg(long, env = "NFSE_BACKEND", value_enum, default_value = "fs", global = true)]
    backend: Backend,

    /// Local data directory for the fs backend.
    #[arg(long, env = "NFSE_DATA_DIR", default_value = "./data", global = true)]
    data_dir: PathBuf,

    /// JSON tenant file (array of tenant records).
    #[arg(long = "tenants", env = "NFSE_TENANTS", global = true)]
    tenants_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(flatten)]
    tuning: TuningArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run harvesting rounds forever, sleeping between rounds.
    Run {
        /// Seconds to wait between rounds.
        #[arg(long, env = "NFSE_INTERVAL_SECS", default_value_t = 90)]
        interval: u64,
    },

    /// Run a single harvesting round and print the summary.
    Once {
        /// Pretend today is this date (YYYY-MM-DD); the previous month is harvested.
        #[arg(long)]
        today: Option<NaiveDate>,

        /// Print the full round summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Rebuild period archives without fetching.
    Consolidate {
        /// Period as YYYY-MM or YYYYMM. Defaults to the previous month.
        #[arg(long)]
        period: Option<Period>,
    },

    /// Inspect or repair a tenant cursor.
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
    },

    /// List tenants and whether they take part in the next round.
    Tenants,

    /// Check DNS and HTTP reachability of the upstream.
    Diagnose,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   nfse-harvest completions bash > ~/.local/share/bash-completion/completions/nfse-harvest
    ///   nfse-harvest completions zsh > ~/.zfunc/_nfse-harvest
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CursorAction {
    /// Print the stored cursor.
    Show {
        /// Tenant CPF/CNPJ (punctuation allowed).
        tenant: String,
    },
    /// Overwrite the stored cursor, even with a lower value.
    Set { tenant: String, nsu: u64 },
}

fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn parse_tenant(raw: &str) -> anyhow::Result<TenantId> {
    TenantId::normalize(raw).with_context(|| format!("'{raw}' is not a valid CPF/CNPJ"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    let (config, source) = cli
        .tuning
        .apply(HarvestConfig::from_env(), SourceConfig::from_env());
    let options = BackendOptions {
        backend: cli.backend,
        data_dir: cli.data_dir.clone(),
        tenants_file: cli.tenants_file.clone(),
    };
    let backends = || -> anyhow::Result<Backends> {
        if options.backend == Backend::Fs {
            ensure_data_dir(&options.data_dir)?;
        }
        Backends::build(&options, |key| std::env::var(key).ok())
    };

    match cli.command {
        Commands::Run { interval } => {
            let backends = backends()?;
            let harvester = backends.harvester(config, source);
            let interval = Duration::from_secs(interval.max(1));
            tracing::info!(interval_secs = interval.as_secs(), "harvest loop started");
            loop {
                match backends.tenants.load().await {
                    Ok(tenants) => {
                        let summary = harvester.run_round(&tenants).await;
                        print!("{}", render_summary(&summary));
                    }
                    Err(e) => tracing::error!("cannot load tenants, skipping round: {e}"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("interrupted, stopping");
                        break;
                    }
                }
            }
        }

        Commands::Once { today, json } => {
            let backends = backends()?;
            let tenants = backends.tenants.load().await?;
            let harvester = backends.harvester(config, source);
            let today = today.unwrap_or_else(|| today_in(harvester.config().timezone));
            let summary = harvester.run_round_on(&tenants, today).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", render_summary(&summary));
            }
            if summary.failed() > 0 {
                std::process::exit(2);
            }
        }

        Commands::Consolidate { period } => {
            let backends = backends()?;
            let tenants = backends.tenants.load().await?;
            let today = today_in(config.timezone);
            let period = period.unwrap_or_else(|| Period::previous_month_of(today));
            let harvester = backends.harvester(config, source);
            let mut failed = 0usize;
            for (tenant, result) in harvester.consolidate_all(&tenants, &period, today).await {
                match result {
                    Ok(outcome) => println!("{tenant} {period}: {}", render_consolidation(&outcome)),
                    Err(e) => {
                        failed += 1;
                        println!("{tenant} {period}: failed ({e})");
                    }
                }
            }
            if failed > 0 {
                std::process::exit(2);
            }
        }

        Commands::Cursor { action } => {
            let backends = backends()?;
            match action {
                CursorAction::Show { tenant } => {
                    let tenant = parse_tenant(&tenant)?;
                    match backends.cursors.load(&tenant).await? {
                        Some(nsu) => println!("{tenant} {nsu}"),
                        None => println!(
                            "{tenant} (none, rounds start after {})",
                            config.default_start
                        ),
                    }
                }
                CursorAction::Set { tenant, nsu } => {
                    let tenant = parse_tenant(&tenant)?;
                    let previous = backends.cursors.load(&tenant).await?;
                    backends.cursors.store(&tenant, nsu).await?;
                    tracing::warn!(tenant = %tenant, previous = ?previous, nsu, "cursor overwritten by operator");
                    println!(
                        "{tenant} {} -> {nsu}",
                        previous.map_or("none".to_string(), |p| p.to_string())
                    );
                }
            }
        }

        Commands::Tenants => {
            let backends = backends()?;
            let today = today_in(config.timezone);
            for tenant in backends.tenants.load().await? {
                let state = match tenant.eligibility(today) {
                    Ok(()) => "eligible".to_string(),
                    Err(reason) => format!("skipped: {reason}"),
                };
                println!(
                    "{} {:<30} {:<24} {state}",
                    tenant.id,
                    tenant.name,
                    tenant.archive_label()
                );
            }
        }

        Commands::Diagnose => {
            let diagnosis = diagnose(&source.base_url, source.timeout).await?;
            println!("{}", serde_json::to_string_pretty(&diagnosis)?);
            if !diagnosis.healthy() {
                std::process::exit(1);
            }
        }

        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "nfse-harvest",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}
