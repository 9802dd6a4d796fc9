//! Callflow Server entry point

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use callflow_server::{config::Config, crypto, router, spawn_ringing_sweep, storage::Storage, AppState};

/// Callflow Server CLI
#[derive(Parser)]
#[command(name = "callflow-server")]
#[command(about = "Call signaling relay and call-log server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue a bearer token for a user
    IssueToken {
        #[arg(long)]
        user_id: String,

        /// Overrides auth.token_ttl_hours
        #[arg(long)]
        ttl_hours: Option<i64>,
    },

    /// Print a user's recent calls
    ListCalls {
        #[arg(long)]
        user_id: String,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Run the server
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "callflow_server=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::load(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::IssueToken { user_id, ttl_hours } => {
            issue_token(&config, &user_id, ttl_hours)?;
        }
        Commands::ListCalls { user_id, limit } => {
            list_calls(&config, &user_id, limit).await?;
        }
        Commands::Run => {
            run_server(config).await?;
        }
    }

    Ok(())
}

fn issue_token(config: &Config, user_id: &str, ttl_hours: Option<i64>) -> anyhow::Result<()> {
    if user_id.trim().is_empty() {
        anyhow::bail!("user id must not be empty");
    }

    let ttl = ttl_hours.unwrap_or(config.auth.token_ttl_hours);
    let token = crypto::issue_token(user_id, &config.auth.token_secret, ttl);

    println!("=== Token for {} (valid {}h) ===", user_id, ttl);
    println!("{}", token);

    Ok(())
}

async fn list_calls(config: &Config, user_id: &str, limit: i64) -> anyhow::Result<()> {
    let storage = Storage::new(&config.storage.database_path).await?;
    let calls = storage.list_calls_for_user(user_id, limit).await?;

    println!("=== Calls for {} ===", user_id);
    for call in calls {
        println!(
            "#{} | {} | {} -> {} | {} | {}s | {}",
            call.id, call.call_type, call.caller_id, call.receiver_id, call.status, call.duration, call.created_at
        );
    }

    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting Callflow Server v{}", env!("CARGO_PKG_VERSION"));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(config).await?;

    spawn_ringing_sweep(&state);
    let app = router(state);

    tracing::info!("Listening on {}", addr);
    let listener = TcpListener::bind(&addr).await?;

    axum::serve(listener, app).await?;

    Ok(())
}
