//! Tessera storage server daemon.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tessera::logger_init;
use tessera::pf_error;
use tessera::pf_info;
use tessera::server::{RegionHost, ServerConfig};
use tessera::TesseraError;
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Root directory of the instance.
    #[arg(short, long)]
    root_dir: PathBuf,

    /// Local IP to use for the server's address identity.
    #[arg(short, long, default_value_t = Ipv4Addr::LOCALHOST)]
    bind_ip: Ipv4Addr,

    /// Port of the server's address identity.
    #[arg(short, long, default_value_t = 60020)]
    port: u16,

    /// Config overrides as a TOML string.
    #[arg(long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 16)]
    threads: usize,
}

impl CliArgs {
    fn sanitize(&self) -> Result<(), TesseraError> {
        if self.port <= 1024 {
            Err(TesseraError::msg(format!("invalid port {}", self.port)))
        } else if self.threads < 2 {
            Err(TesseraError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of the tessera storage server. The master link
/// (heartbeats and instructions) rides the externally provided wire
/// transport; this daemon owns the region-hosting side.
fn server_main() -> Result<(), TesseraError> {
    let args = CliArgs::parse();
    args.sanitize()?;
    let config = ServerConfig::parsed(args.config.as_deref())?;
    let address = format!("{}:{}", args.bind_ip, args.port);
    let _ = tessera::ME.set(address.clone());

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })
    .map_err(|e| TesseraError::msg(e.to_string()))?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-server")
        .build()?;
    runtime.block_on(async move {
        let host =
            RegionHost::new_and_setup(args.root_dir, address, config).await?;

        rx_term.changed().await?;
        pf_info!("server caught termination signal");

        let _exit_report = host.shutdown_messages().await?;
        host.stop().await
    })
}

fn main() -> ExitCode {
    logger_init();
    if let Err(e) = server_main() {
        pf_error!("server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
