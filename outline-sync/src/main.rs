mod app;
mod config;

use app::AppContext;
use clap::{Args, Parser, Subcommand};
use config::{Config, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use shared::metrics_defs::describe_all;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_LOG_FILTER: &str =
    "outline_sync=info,reconciler=info,registry=info,token_store=info,connect=info,shared=info";

#[derive(Parser)]
#[command(name = "outline-sync", about = "Keeps relay proxies in sync with issued access keys")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the connect API and reconcile continuously.
    Run(ConfigArgs),
    /// Run a single reconciliation pass and exit.
    Reconcile {
        #[command(flatten)]
        args: ConfigArgs,
        /// Only reconcile this server.
        #[arg(long)]
        server: Option<String>,
    },
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, default_value = "outline-sync.yaml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = match &cli.command {
        CliCommand::Run(args) | CliCommand::Reconcile { args, .. } => &args.config,
    };

    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", config_path.display());
            return ExitCode::FAILURE;
        }
    };

    let _sentry = init_logging(config.logging.as_ref());
    if let Some(metrics) = &config.metrics {
        init_metrics(metrics);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "could not start runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        let app = match AppContext::build(&config).await {
            Ok(app) => app,
            Err(e) => {
                tracing::error!(error = %e, "startup failed");
                return ExitCode::FAILURE;
            }
        };

        match cli.command {
            CliCommand::Run(_) => match app.run(&config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "outline-sync stopped");
                    ExitCode::FAILURE
                }
            },
            CliCommand::Reconcile { server, .. } => {
                match app.reconcile_once(server.as_deref()).await {
                    true => ExitCode::SUCCESS,
                    false => ExitCode::FAILURE,
                }
            }
        }
    })
}

fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let sentry = logging
        .and_then(|logging| logging.sentry_dsn.as_deref())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with(fmt::layer())
        .with(sentry.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    sentry
}

fn init_metrics(config: &MetricsConfig) {
    let recorder = match StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some("outline_sync"))
    {
        Ok(recorder) => recorder,
        Err(e) => {
            tracing::warn!(error = %e, "statsd exporter disabled");
            return;
        }
    };
    if let Err(e) = metrics::set_global_recorder(recorder) {
        tracing::warn!(error = %e, "metrics recorder already installed");
        return;
    }

    describe_all(reconciler::metrics_defs::ALL_METRICS);
    describe_all(token_store::metrics_defs::ALL_METRICS);
    describe_all(connect::metrics_defs::ALL_METRICS);
}
