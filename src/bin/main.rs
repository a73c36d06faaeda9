use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use procman::{
    cli::{Cli, Commands, parse_args},
    config::load_config,
    supervisor::{Supervisor, SupervisorOptions},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Start { config, env, only } => {
            let mut ecosystem = load_config(config.as_deref())?;
            if let Some(name) = only.as_deref() {
                ecosystem = ecosystem.only(name)?;
            }

            let stop = Arc::new(AtomicBool::new(false));
            register_signal_handler(Arc::clone(&stop))?;

            let supervisor =
                Supervisor::new(ecosystem, env.as_deref(), SupervisorOptions::default())?;
            if let Err(err) = supervisor.start() {
                let _ = supervisor.shutdown();
                return Err(err.into());
            }

            supervisor.run_until(&stop)?;
            info!("procman stopped");
        }
        Commands::Show { config, env } => {
            let ecosystem = load_config(config.as_deref())?;
            let plans = ecosystem.launch_plans(env.as_deref());
            println!("{}", serde_json::to_string_pretty(&plans)?);
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn register_signal_handler(stop: Arc<AtomicBool>) -> Result<(), Box<dyn Error>> {
    ctrlc::set_handler(move || {
        if stop.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already in progress");
        } else {
            info!("procman is shutting down... stopping all apps");
        }
    })?;

    Ok(())
}
