use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::anyhow;
use clap::Parser;
use clap::Subcommand;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use zonneplan::Config;
use zonneplan::Engine;
use zonneplan::FileTokenStore;
use zonneplan::ZonneplanIntegration;
use zonneplan::config::LoggingConfig;
use zonneplan_api::ApiClient;
use zonneplan_api::AuthClient;
use zonneplan_api::TokenStore;

const LOGIN_POLL_INTERVAL: Duration = Duration::from_secs(3);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Parser)]
#[command(author, version, about = "Zonneplan account poller and control bridge")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "zonneplan.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the account and serve its entities (default)
    Run,

    /// Sign in through the mailed login link and store the token
    Login {
        /// Overrides `account.email` from the config file
        #[arg(long)]
        email: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    init_logging(&config.logging);
    tracing::info!("Loaded config from: {}", cli.config.display());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Login { email } => login(config, email).await,
    }
}

fn init_logging(logging: &LoggingConfig) {
    let targets = Targets::new()
        .with_default(LevelFilter::from(logging.level))
        .with_targets(
            logging
                .overrides
                .iter()
                .map(|(target, level)| (target.clone(), LevelFilter::from(*level))),
        );

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(targets)
        .init();
}

async fn login(config: Config, email: Option<String>) -> anyhow::Result<()> {
    let email = email.unwrap_or(config.account.email);
    let auth = AuthClient::new(&config.api.client_config())?;

    let uuid = auth
        .request_login(&email)
        .await
        .context("requesting a login link")?;
    tracing::info!("Login link sent to {}; open it to continue", email);

    let token = auth
        .wait_for_login(&email, &uuid, LOGIN_POLL_INTERVAL, LOGIN_TIMEOUT)
        .await
        .context("waiting for the login link")?;

    FileTokenStore::new(&config.account.token_path)
        .save(&token)
        .await
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("saving token to {}", config.account.token_path.display()))?;
    tracing::info!(
        "Signed in; token stored in {}",
        config.account.token_path.display()
    );
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!("zonneplan starting");

    let store = Arc::new(FileTokenStore::new(&config.account.token_path));
    let token = store
        .load()
        .await
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("reading {}", config.account.token_path.display()))?
        .ok_or_else(|| anyhow!("not signed in; run `zonneplan login` first"))?;

    let api = Arc::new(ApiClient::new(
        &config.api.client_config(),
        Some(token),
        Some(store as Arc<dyn TokenStore>),
    )?);

    let engine = Arc::new(Engine::new());
    engine
        .register_integration(Box::new(ZonneplanIntegration::new(api, &config.polling)))
        .await;

    let engine_task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let server_task = if config.http.enabled {
        let engine = engine.clone();
        let listen = config.http.listen.clone();
        let port = config.http.port;
        Some(tokio::spawn(async move {
            if let Err(e) = zonneplan::api::serve(listen, port, engine, shutdown_rx).await {
                tracing::error!("HTTP API server failed: {}", e);
            }
        }))
    } else {
        tracing::info!("HTTP API disabled");
        None
    };

    tracing::info!("Press Ctrl+C to exit");
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }

    let _ = shutdown_tx.send(());
    if let Some(server_task) = server_task {
        let _ = server_task.await;
    }
    engine.shutdown().await;
    engine_task.abort();

    tracing::info!("zonneplan shutdown complete");
    Ok(())
}
