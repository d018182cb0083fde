use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::sync::watch;

use custodian::{
    commons::CustodyEmptyResult,
    config::Config,
    constants::{CUSTODIAN_DEFAULT_CONFIG_FILE, CUSTODIAN_SERVER_APP},
    server::manager::CustodyManager,
};

/// Keeps X.509 certificates issued, installed and renewed.
#[derive(Parser)]
#[command(name = CUSTODIAN_SERVER_APP, version)]
struct Args {
    /// Override the path to the config file
    #[arg(short, long, value_name = "FILE", default_value = CUSTODIAN_DEFAULT_CONFIG_FILE)]
    config: String,

    /// Validate distributions on their targets without committing them
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match Config::create(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            ::std::process::exit(1);
        }
    };
    if args.dry_run {
        config.dry_run = true;
    }

    if let Err(e) = run(Arc::new(config)).await {
        error!("{}", e);
        eprintln!("{}", e);
        ::std::process::exit(1);
    }
}

async fn run(config: Arc<Config>) -> CustodyEmptyResult {
    let manager = CustodyManager::build(config)?;

    manager.resume()?;

    let (stop, shutdown) = watch::channel(false);
    let renewals = manager.start_renewals(shutdown);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for shutdown signal: {}", e);
    }
    info!("Shutting down");

    let _ = stop.send(true);
    if let Err(e) = renewals.await {
        error!("Renewal scheduler ended abnormally: {}", e);
    }
    manager.shutdown();
    Ok(())
}
