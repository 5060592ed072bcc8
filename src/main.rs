use paycycle::gateway::HttpHoldGateway;
use paycycle::notify::TracingEmitter;
use paycycle::{config::Config, db::init_db, HoldGateway, Ledger, NotificationEmitter, Payday};
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize database and dependencies
    let pool = match init_db(&config.database_path).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let ledger = Arc::new(Ledger::new(pool));
    let gateway: Arc<dyn HoldGateway> =
        Arc::new(HttpHoldGateway::new(config.gateway_url.clone()));
    let emitter: Arc<dyn NotificationEmitter> = Arc::new(TracingEmitter);

    // Run one settlement cycle, resuming any interrupted one.
    let mut payday = match Payday::start(
        ledger,
        gateway,
        emitter,
        config.hold_workers,
        PathBuf::from(&config.dump_dir),
    )
    .await
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to open cycle: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = payday.run().await {
        eprintln!("Payday failed: {}", e);
        std::process::exit(1);
    }
}
