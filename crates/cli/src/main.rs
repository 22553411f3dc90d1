mod accounts_commands;
mod config_commands;
mod run_commands;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "parrot", about = "Multi-account Telegram autoresponder")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Custom config directory (overrides default ~/.config/parrot/).
    #[arg(long, global = true, env = "PARROT_CONFIG_DIR")]
    config_dir: Option<std::path::PathBuf>,
    /// Custom data directory (overrides default data dir).
    #[arg(long, global = true, env = "PARROT_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control bot and every enabled autoresponder (default when no
    /// subcommand is provided).
    Run,
    /// List persisted accounts without connecting them.
    Accounts {
        /// Only show accounts of this operator.
        #[arg(long)]
        owner: Option<i64>,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_telemetry(&cli);

    // Apply directory overrides before loading config
    if let Some(ref dir) = cli.config_dir {
        parrot_config::set_config_dir(dir.clone());
    }
    if let Some(ref dir) = cli.data_dir {
        parrot_config::set_data_dir(dir.clone());
    }

    match cli.command {
        None | Some(Commands::Run) => {
            info!(version = env!("CARGO_PKG_VERSION"), "parrot starting");
            let config = parrot_config::discover_and_load();
            run_commands::handle_run(config).await
        },
        Some(Commands::Accounts { owner }) => {
            let config = parrot_config::discover_and_load();
            let dir = parrot_config::sessions_dir(&config);
            accounts_commands::handle_accounts(&dir, owner).await
        },
        Some(Commands::Config { action }) => config_commands::handle_config(action),
    }
}
