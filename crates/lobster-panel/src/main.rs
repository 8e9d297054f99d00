//! Lobster control plane
//!
//! Serves the web panel and signed API, runs the billing and catalog jobs,
//! and proxies VNC consoles.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use lobster_core::config::{Config, load_config};
use lobster_core::tracing_init::init_tracing;

use lobster_panel::auth::AuthService;
use lobster_panel::billing::{AccountService, Billing};
use lobster_panel::catalog::CatalogService;
use lobster_panel::driver::DriverRegistry;
use lobster_panel::jobs::Jobs;
use lobster_panel::mail::MailService;
use lobster_panel::payment::PaymentRegistry;
use lobster_panel::server::{self, AppState};
use lobster_panel::storage::PanelDatabase;
use lobster_panel::vm::VmService;
use lobster_panel::websockify::Websockify;

#[derive(Parser, Debug)]
#[command(name = "lobster")]
#[command(version, about = "Lobster control plane - VM panel, billing and signed API")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "LOBSTER_CONFIG")]
    config: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the panel, API, console proxy and background jobs (default).
    Serve,
    /// Apply database migrations and exit.
    Migrate,
    /// Zero every VM's monthly bandwidth counter.
    ResetBandwidth,
    /// Grant operator access to an existing account.
    Promote {
        /// Username of the account.
        username: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("lobster_panel=info,lobster=info", args.log_json);

    let config_path = args.config.clone().or_else(default_config_path);
    let config = Arc::new(load_config(config_path.as_deref())?);

    let db_path = config
        .database_path()
        .context("Cannot determine database path; set database.path")?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create {}", parent.display()))?;
    }
    info!(path = %db_path.display(), "Opening panel database");
    let db = PanelDatabase::open(&db_path).await?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(db, config).await,
        Command::Migrate => Ok(()),
        Command::ResetBandwidth => {
            let reset = db.reset_bandwidth().await?;
            info!(vms = reset, "Bandwidth counters reset");
            Ok(())
        }
        Command::Promote { username } => {
            let user = db
                .get_user_by_username(&username)
                .await
                .with_context(|| format!("No account named {username}"))?;
            db.set_user_admin(user.id, true).await?;
            info!(user_id = user.id, %username, "Granted operator access");
            Ok(())
        }
    }
}

async fn serve(db: PanelDatabase, config: Arc<Config>) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.http.addr,
        "Starting lobster"
    );

    let registry = Arc::new(DriverRegistry::from_config(&config.regions)?);
    for region in registry.regions() {
        db.ensure_region(&region).await?;
    }

    let mailer = MailService::mailer_from_config(&config)?;
    let mail = MailService::new(mailer, db.clone(), &config);
    let websockify = Arc::new(Websockify::new(&config.novnc.url));

    let billing = Billing::new(
        db.clone(),
        Arc::clone(&registry),
        mail.clone(),
        Arc::clone(&config),
    );
    let vms = VmService::new(
        db.clone(),
        Arc::clone(&registry),
        billing.clone(),
        mail.clone(),
        Arc::clone(&config),
        Arc::clone(&websockify),
    );
    let accounts = AccountService::new(
        db.clone(),
        billing,
        vms.clone(),
        mail.clone(),
        Arc::clone(&config),
    );
    let catalog = CatalogService::new(db.clone(), Arc::clone(&registry), mail.clone());
    let auth = AuthService::new(db.clone(), mail.clone(), Arc::clone(&config));
    let payments = Arc::new(PaymentRegistry::from_config(&config.payments, &accounts)?);

    let (cron, cache) = Jobs::new(db.clone(), accounts.clone(), catalog.clone()).spawn();

    let state = AppState {
        db,
        config: Arc::clone(&config),
        registry,
        auth,
        vms,
        accounts,
        catalog,
        payments,
        mail,
    };
    let app = server::router(state).into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(&config.http.addr)
        .await
        .with_context(|| format!("Cannot listen on {}", config.http.addr))?;
    info!(addr = %config.http.addr, "Panel listening");

    if config.novnc.listen.is_empty() {
        info!("Console proxy disabled");
    } else {
        let console = tokio::net::TcpListener::bind(&config.novnc.listen)
            .await
            .with_context(|| format!("Cannot listen on {}", config.novnc.listen))?;
        info!(addr = %config.novnc.listen, "Console proxy listening");
        let router = websockify.router();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(console, router).await {
                warn!(error = %e, "Console proxy stopped");
            }
        });
    }

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    cron.abort();
    cache.abort();
    info!("Lobster stopped");
    Ok(())
}

/// `~/.lobster/lobster.toml`, when it exists.
fn default_config_path() -> Option<PathBuf> {
    let path = dirs::home_dir()?.join(".lobster").join("lobster.toml");
    path.exists().then_some(path)
}
