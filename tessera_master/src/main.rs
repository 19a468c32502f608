//! Tessera cluster master daemon.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tessera::cluster::LocalCluster;
use tessera::logger_init;
use tessera::master::MasterConfig;
use tessera::pf_error;
use tessera::pf_info;
use tessera::server::{dump_log, split_log, ServerConfig};
use tessera::TesseraError;
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 16)]
    threads: usize,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the master (single-process local mode: the wire transport is
    /// provided externally; local mode hosts the storage servers in
    /// process).
    Start {
        /// Root directory of the instance.
        #[arg(short, long)]
        root_dir: PathBuf,

        /// Local IP the (externally provided) RPC endpoint would bind.
        #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
        bind_ip: Ipv4Addr,

        /// Port of the would-be RPC endpoint.
        #[arg(short, long, default_value_t = 60000)]
        port: u16,

        /// Number of in-process storage servers to host in local mode.
        #[arg(short, long, default_value_t = 2)]
        servers: usize,

        /// Master config overrides as a TOML string.
        #[arg(long)]
        config: Option<String>,

        /// Storage-server config overrides as a TOML string.
        #[arg(long)]
        server_config: Option<String>,
    },

    /// Dump one or more write-ahead log files to stdout.
    DumpLog {
        /// Log file paths.
        files: Vec<PathBuf>,
    },

    /// Split one or more dead servers' log directories into per-region
    /// replay logs.
    SplitLog {
        /// Root directory of the instance.
        #[arg(short, long)]
        root_dir: PathBuf,

        /// Log directories to split.
        dirs: Vec<PathBuf>,
    },
}

async fn run_start(
    root_dir: PathBuf,
    bind_ip: Ipv4Addr,
    port: u16,
    servers: usize,
    config: Option<String>,
    server_config: Option<String>,
    mut rx_term: watch::Receiver<bool>,
) -> Result<(), TesseraError> {
    let master_config = MasterConfig::parsed(config.as_deref())?;
    let server_config = ServerConfig::parsed(server_config.as_deref())?;
    pf_info!("would-be RPC bind address: {}:{}", bind_ip, port);

    let cluster = LocalCluster::new_and_setup(
        root_dir,
        servers,
        server_config,
        master_config,
    )
    .await?;

    // run until termination signal
    rx_term.changed().await?;
    pf_info!("master caught termination signal");
    cluster.shutdown().await
}

async fn run_dump_log(files: Vec<PathBuf>) -> Result<(), TesseraError> {
    for file in files {
        for line in dump_log(&file).await? {
            println!("{}", line);
        }
    }
    Ok(())
}

async fn run_split_log(
    root_dir: PathBuf,
    dirs: Vec<PathBuf>,
) -> Result<(), TesseraError> {
    for dir in dirs {
        let regions = split_log(&root_dir, &dir).await?;
        pf_info!("split '{}' into {} replay log(s)", dir.display(), regions);
    }
    Ok(())
}

/// Actual main function of the tessera master.
fn master_main() -> Result<(), TesseraError> {
    let args = CliArgs::parse();
    let _ = tessera::ME.set("m".into());
    if args.threads < 2 {
        return Err(TesseraError::msg(format!(
            "invalid number of threads {}",
            args.threads
        )));
    }

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })
    .map_err(|e| TesseraError::msg(e.to_string()))?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-master")
        .build()?;
    runtime.block_on(async move {
        match args.command {
            Command::Start {
                root_dir,
                bind_ip,
                port,
                servers,
                config,
                server_config,
            } => {
                run_start(
                    root_dir,
                    bind_ip,
                    port,
                    servers,
                    config,
                    server_config,
                    rx_term,
                )
                .await
            }
            Command::DumpLog { files } => run_dump_log(files).await,
            Command::SplitLog { root_dir, dirs } => {
                run_split_log(root_dir, dirs).await
            }
        }
    })
}

fn main() -> ExitCode {
    logger_init();
    if let Err(e) = master_main() {
        pf_error!("master_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
