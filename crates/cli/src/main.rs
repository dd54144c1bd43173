use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mailhook")]
#[command(about = "mailhook CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: MAILHOOK_CONFIG_PATH or ~/.mailhook/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the webhook gateway. Accepts POST /webhook and forwards emails to the downstream agent.
    Serve {
        /// Config file path (default: MAILHOOK_CONFIG_PATH or ~/.mailhook/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP port (default from config or 8080)
        #[arg(long, short)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("mailhook {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(mailhook::config::default_config_path);
    let dir = mailhook::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = mailhook::config::load_config(config_path)?;
    if let Some(p) = port {
        config.server.port = p;
    }
    log::info!(
        "starting gateway on {}:{} (config {})",
        config.server.bind,
        config.server.port,
        path.display()
    );
    if mailhook::config::resolve_downstream_endpoint(&config).is_none()
        || mailhook::config::resolve_downstream_api_key(&config).is_none()
    {
        log::warn!("downstream endpoint or api key not configured; every dispatch will fail until set");
    }
    let telemetry = mailhook::telemetry::Telemetry::from_config(&config);
    mailhook::gateway::run_gateway(config, telemetry).await
}
