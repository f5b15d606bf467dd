use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use parley_core::config::{Config, GatewayConfig, LoggingConfig};
use parley_gateway::GatewayState;
use parley_pipeline::{ComponentPool, PipelineSettings};

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Real-time voice agent for phone calls: speech in, language model, speech out",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the media-stream gateway
    Serve {
        /// Port to listen on (default: 8765)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show gateway status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value by dotted path
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".to_string())
    };
    let mut directives = vec![level];
    directives.extend(logging.filters.iter().cloned());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives.join(",")));
    let writer = match logging.output.as_str() {
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn service_provider(config: &Config, kind: &str, default: &str) -> String {
    config
        .get_path(&format!("services.{kind}.provider"))
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{default} (default)"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    // Load config
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let mut config = Config::load(&config_path)?;

    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose);

    match cli.command {
        Commands::Serve { port, bind } => {
            if port.is_some() || bind.is_some() {
                let gateway = config.gateway.get_or_insert_with(GatewayConfig::default);
                if let Some(port) = port {
                    gateway.port = port;
                }
                if bind.is_some() {
                    gateway.bind = bind;
                }
            }

            let (warnings, errors) = config.validate();
            for warning in &warnings {
                tracing::warn!("{warning}");
            }
            if !errors.is_empty() {
                for error in &errors {
                    tracing::error!("{error}");
                }
                anyhow::bail!("invalid configuration ({} errors)", errors.len());
            }

            let pool = Arc::new(ComponentPool::new(PipelineSettings::from_config(&config)));
            pool.prepare().await?;

            tracing::info!(
                "Starting Parley gateway on {}:{}",
                config.bind_addr(),
                config.gateway_port()
            );
            let state = Arc::new(GatewayState::new(Arc::new(config), pool));
            parley_gateway::start_gateway(state).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration errors", errors.len());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
        Commands::Status => {
            println!("Parley v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Gateway: {}:{}", config.bind_addr(), config.gateway_port());
            println!("STT: {}", service_provider(&config, "stt", "deepgram"));
            println!("LLM: {}", service_provider(&config, "llm", "cerebras"));
            println!("TTS: {}", service_provider(&config, "tts", "cartesia"));
            let recording = config.recording();
            if recording.enabled {
                println!(
                    "Recording: {} uploader, bucket '{}'",
                    recording.uploader, recording.bucket
                );
            } else {
                println!("Recording: disabled");
            }

            let url = format!("http://127.0.0.1:{}/health", config.gateway_port());
            let health = reqwest::Client::new()
                .get(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await;
            match health {
                Ok(resp) if resp.status().is_success() => {
                    let body: serde_json::Value = resp.json().await?;
                    println!(
                        "Status: running ({} active sessions, {} since start)",
                        body["sessions"], body["total_sessions"]
                    );
                }
                _ => println!("Status: not running"),
            }
        }
    }

    Ok(())
}
