use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;

use th_cli::cli::{self, Cli, Command, ConfigCommand};
use th_domain::config::{Config, ObservabilityConfig};
use th_mcp_client::McpManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            let (config, config_path) = cli::load_config()?;
            let tracer_provider = init_tracing(&config.observability);
            run_server(config, config_path, tracer_provider).await
        }
        Some(Command::Tools { json }) => {
            init_cli_tracing();
            let (config, _) = cli::load_config()?;
            cli::tools::list(&config, json).await
        }
        Some(Command::Call { server, tool, args, json }) => {
            init_cli_tracing();
            let (config, _) = cli::load_config()?;
            let ok = cli::tools::call(&config, &server, &tool, args.as_deref(), json).await?;
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Status { json }) => {
            init_cli_tracing();
            let (config, _) = cli::load_config()?;
            cli::status::run(&config, json).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = cli::load_config()?;
            if !cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _) = cli::load_config()?;
            cli::config::show(&config)
        }
        Some(Command::Version) => {
            println!("toolhost {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
///
/// When `otlp_endpoint` is configured, an OpenTelemetry layer is added so
/// session spans are also exported via OTLP/gRPC. The returned provider
/// must be shut down on exit to flush pending spans.
fn init_tracing(
    obs: &ObservabilityConfig,
) -> Option<opentelemetry_sdk::trace::SdkTracerProvider> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,th_mcp_client=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer().json();

    let Some(endpoint) = &obs.otlp_endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
        return None;
    };

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(e) => e,
        Err(e) => {
            eprintln!(
                "WARNING: failed to create OTLP exporter for {endpoint}: {e}; \
                 starting without OpenTelemetry"
            );
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();
            return None;
        }
    };

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(obs.service_name.clone())
        .build();

    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(
            obs.sample_rate,
        ))
        .with_resource(resource)
        .build();

    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer("toolhost"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    Some(tracer_provider)
}

/// Compact stderr-only tracing for one-shot commands, `warn` by default so
/// stdout stays clean.
fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Start every enabled server and hold the pool until a shutdown signal.
async fn run_server(
    config: Config,
    config_path: String,
    tracer_provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
) -> anyhow::Result<()> {
    tracing::info!(config = %config_path, "toolhost starting");

    for issue in config.validate() {
        tracing::warn!(%issue, "config issue");
    }

    let manager = McpManager::from_config(&config.mcp).await;

    for status in manager.statuses().await {
        tracing::info!(
            server_id = %status.id,
            state = %status.state,
            tool_count = status.tool_count,
            error = status.last_error.as_deref().unwrap_or(""),
            "MCP server status"
        );
    }
    for (server_id, tool) in manager.get_all_tools().await {
        tracing::info!(server_id = %server_id, tool = %tool.name, "tool available");
    }

    shutdown_signal().await;

    manager.stop_all().await;

    if let Some(provider) = tracer_provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = ?e, "OpenTelemetry tracer provider shutdown failed");
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
            }
        }
    }

    if ctrl_c.await.is_ok() {
        tracing::info!("received SIGINT, shutting down");
    }
}
