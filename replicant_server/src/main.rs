//! Replicant server node executable.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use replicant::{
    logger_init, pf_error, pf_info, ReplicaConfigMultiPaxos, ReplicaId,
    Replicant, ReplicantError, ME,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// ID of this node; index into the configured peers list.
    #[arg(short, long)]
    id: ReplicaId,

    /// Path to the cluster configuration TOML file.
    #[arg(short, long)]
    config: PathBuf,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments and the config file they name,
    /// return `Ok(config)` on success or `Err(ReplicantError)` on any error.
    fn sanitize(&self) -> Result<ReplicaConfigMultiPaxos, ReplicantError> {
        if self.threads < 2 {
            return Err(ReplicantError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }
        let config_str = fs::read_to_string(&self.config).map_err(|e| {
            ReplicantError::msg(format!(
                "failed to read config '{}': {}",
                self.config.display(),
                e
            ))
        })?;
        let config = ReplicaConfigMultiPaxos::from_toml(Some(&config_str))?;
        config.validate(self.id)?;
        Ok(config)
    }
}

/// Actual main function of Replicant server node.
fn server_main() -> Result<(), ReplicantError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let _ = ME.set(format!("{}", args.id));
    let config = args.sanitize()?;

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })
    .map_err(ReplicantError::msg)?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-replicant")
            .build()?;

        // enter tokio runtime, start the node, and wait for termination
        runtime.block_on(async move {
            let node = Replicant::new(args.id, &config)?;
            let api_addr = node.start().await?;
            pf_info!("serving clients on {}", api_addr);

            while !*rx_term.borrow() {
                if rx_term.changed().await.is_err() {
                    break;
                }
            }

            node.stop().await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), ReplicantError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of Replicant server node.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
