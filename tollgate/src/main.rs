use clap::Parser;
use gateway::config::{Config, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use shared::metrics_defs::MetricDef;
use std::future::Future;
use std::process;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
enum CliCommand {
    /// Run the ingestion gateway (configured from TOLLGATE_* env vars)
    Serve,
    /// Show all metrics definitions as markdown table
    ShowMetrics,
    /// Sync METRICS.md with current metric definitions
    SyncMetrics,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Invalid config: {0}")]
    ConfigError(#[from] gateway::config::ConfigError),
    #[error("Failed to create runtime: {0}")]
    RuntimeError(#[from] std::io::Error),
}

fn main() {
    init_tracing();

    if let Err(e) = cli() {
        tracing::error!(error = %e, "Startup error");
        std::process::exit(1);
    }
}

fn cli() -> Result<(), CliError> {
    let cmd = CliCommand::parse();

    match &cmd {
        CliCommand::Serve => {
            let config = Config::from_env()?;
            let _sentry_guard = init_sentry(config.logging.clone());
            init_statsd_recorder("tollgate.gateway", config.metrics.clone());

            run_async(gateway::run(config))?;
            Ok(())
        }
        CliCommand::ShowMetrics => {
            println!("{}", generate_metrics_table(gateway::metrics_defs::ALL_METRICS));
            println!();
            println!(
                "{}",
                generate_metrics_table(identity::metrics_defs::ALL_METRICS)
            );
            Ok(())
        }
        CliCommand::SyncMetrics => {
            let path = "METRICS.md";
            let mut content = std::fs::read_to_string(path).expect("Failed to read METRICS.md");

            content = sync_section(
                &content,
                "GATEWAY_METRICS",
                &generate_metrics_table(gateway::metrics_defs::ALL_METRICS),
            );
            content = sync_section(
                &content,
                "IDENTITY_METRICS",
                &generate_metrics_table(identity::metrics_defs::ALL_METRICS),
            );

            std::fs::write(path, content).expect("Failed to write METRICS.md");
            println!("Synced METRICS.md");
            Ok(())
        }
    }
}

fn sync_section(content: &str, name: &str, table: &str) -> String {
    let start_marker = format!("<!-- {}:START -->", name);
    let end_marker = format!("<!-- {}:END -->", name);

    let start_idx = content
        .find(&start_marker)
        .unwrap_or_else(|| panic!("Missing {} marker", start_marker));
    let end_idx = content
        .find(&end_marker)
        .unwrap_or_else(|| panic!("Missing {} marker", end_marker));

    format!(
        "{}{}\n{}\n{}{}",
        &content[..start_idx],
        start_marker,
        table,
        end_marker,
        &content[end_idx + end_marker.len()..]
    )
}

fn generate_metrics_table(metrics: &[MetricDef]) -> String {
    let mut lines = vec![
        "| Metric | Type | Description |".to_string(),
        "|--------|------|-------------|".to_string(),
    ];
    for m in metrics {
        lines.push(format!(
            "| `{}` | {} | {} |",
            m.name,
            m.metric_type.as_str(),
            m.description
        ));
    }
    lines.join("\n")
}

fn init_statsd_recorder(prefix: &str, metrics_config: Option<MetricsConfig>) {
    if let Some(MetricsConfig {
        statsd_host,
        statsd_port,
    }) = metrics_config
    {
        let recorder = StatsdBuilder::from(statsd_host, statsd_port)
            .build(Some(prefix))
            .expect("Could not create StatsdRecorder");

        metrics::set_global_recorder(recorder).expect("Could not set global metrics recorder")
    }
}

fn run_async<E: std::error::Error>(
    fut: impl Future<Output = Result<(), E>>,
) -> Result<(), CliError> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    if let Err(e) = rt.block_on(fut) {
        tracing::error!(error = %e, "Runtime error");
        process::exit(1);
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(sentry::integrations::tracing::layer())
        .init();
}

fn init_sentry(logging_config: Option<LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    // The Sentry tracing layer (already initialized in main) starts sending
    // events once this client is initialized.
    logging_config.map(|cfg| {
        sentry::init((
            cfg.sentry_dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    })
}
