use std::collections::HashMap;
use std::env;
use std::error::Error;

use processor_core::config::Settings;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod cmdline;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();
    let Some(("run", args)) = matches.subcommand() else {
        return Err("unknown subcommand".into());
    };

    let vars: HashMap<String, String> = env::vars().collect();
    let mut settings = Settings::try_from(vars)?;
    if let Some(node_name) = args.get_one::<String>(cmdline::NODE_NAME) {
        settings.node_name.clone_from(node_name);
    }
    if args.get_flag(cmdline::PRINT_SETTINGS) {
        info!(?settings, "Resolved settings");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Listening for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown.cancel();
    });

    processor_core::run(settings, cancel)
        .await
        .map_err(|e| format!("Error running processor task scheduler: {e:?}"))?;
    Ok(())
}
