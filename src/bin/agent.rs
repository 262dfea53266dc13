use {
    anyhow::{
        Context,
        Result,
        anyhow,
    },
    bridge_coin_agent::agent::{
        Agent,
        config::{
            Config,
            OpenTelemetryConfig,
        },
    },
    clap::Parser,
    opentelemetry::KeyValue,
    opentelemetry_otlp::WithExportConfig,
    std::{
        io::IsTerminal,
        path::PathBuf,
    },
    tracing_subscriber::{
        EnvFilter,
        prelude::*,
    },
};

#[derive(Parser, Debug)]
#[clap(version)]
/// Bridge Coin Agent - cache main coins and serve the latest bridge coin prices
struct Arguments {
    #[clap(short, long, default_value = "config/config.toml")]
    /// Path to configuration file
    config: PathBuf,

    #[clap(short = 'L', long)]
    /// Whether to print file:line info for each log statement
    log_locations: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Arguments::parse();

    if !args.config.as_path().exists() {
        return Err(anyhow!("No config found under {:?}", args.config.to_str()));
    }

    println!("Loading config from {:?}", args.config.display());

    // Parse config first, the tracing setup depends on it.
    let config = Config::new(&args.config).context("Could not parse config")?;

    init_tracing(&args, config.opentelemetry.as_ref())?;

    // Launch the application. If it fails, print the full backtrace and exit. RUST_BACKTRACE
    // should be set to 1 for this otherwise it will only print the top-level error.
    if let Err(err) = Agent::new(config).start().await {
        eprintln!("{}", err.backtrace());
        err.chain().for_each(|cause| eprintln!("{cause}"));
        return Err(err);
    }

    Ok(())
}

fn init_tracing(args: &Arguments, opentelemetry: Option<&OpenTelemetryConfig>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_file(args.log_locations)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal());

    // Traces are only exported when an endpoint is configured.
    let telemetry = match opentelemetry {
        Some(config) => {
            let otlp_exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&config.exporter_endpoint)
                .with_timeout(config.exporter_timeout_duration);

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(otlp_exporter)
                .with_trace_config(opentelemetry_sdk::trace::config().with_resource(
                    opentelemetry_sdk::Resource::new(vec![KeyValue::new(
                        "service.name",
                        "bridge-coin-agent",
                    )]),
                ))
                .install_batch(opentelemetry_sdk::runtime::Tokio)
                .map_err(|e| anyhow!("Error initializing open telemetry: {}", e))?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let registry = tracing_subscriber::registry().with(filter).with(telemetry);

    // Use the compact formatter if we're in a terminal, otherwise use the JSON formatter.
    if std::io::stderr().is_terminal() {
        registry.with(fmt_layer.compact()).init();
    } else {
        registry.with(fmt_layer.json()).init();
    }

    Ok(())
}
