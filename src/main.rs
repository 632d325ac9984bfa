//! Nexbus - a federated peer-to-peer message bus daemon

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use nexbus::config::Config;
use nexbus::error::Result;
use nexbus::router::{MessageRouter, TransportListener};
use nexbus::transport::{TcpTransport, TransportOptions};
use nexbus::wire::Message;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        let config = Config::default_daemon();
        println!("{}", serde_json::to_string_pretty(&config).unwrap());
        return Ok(());
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    // Load configuration
    let config = if let Some(path) = args.config {
        Config::load(&path)?
    } else {
        info!("No config file specified, using default daemon config");
        Config::default_daemon()
    };

    info!("Nexbus v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))?;

    info!("Goodbye!");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let options = TransportOptions::from_config(&config);
    info!("Daemon guid is {}", options.guid);

    let transport = TcpTransport::new(options, Arc::new(LogRouter));
    transport.set_listener(Arc::new(LogListener));
    transport.start().await?;

    for spec in &config.listen {
        transport.start_listen(spec)?;
    }
    for name in &config.advertise {
        transport.enable_advertisement(name).await?;
    }
    for prefix in &config.discover {
        transport.enable_discovery(prefix).await?;
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    transport.stop();
    transport.join().await;
    Ok(())
}

/// Stand-in daemon core until a real router is attached: log and drop.
struct LogRouter;

#[async_trait]
impl MessageRouter for LogRouter {
    async fn push_message(&self, endpoint: &str, msg: Message) {
        debug!("{} byte message from {}", msg.len(), endpoint);
    }
}

struct LogListener;

impl TransportListener for LogListener {
    fn found_names(&self, bus_addr: &str, guid: &str, _transport: u16, names: &[String], timer: u8) {
        if timer == 0 {
            info!("Peer {} at {} retracted {:?}", guid, bus_addr, names);
        } else {
            info!("Peer {} at {} advertises {:?} ({}s)", guid, bus_addr, names, timer);
        }
    }

    fn bus_connection_lost(&self, connect_spec: &str) {
        info!("Bus connection lost: {}", connect_spec);
    }
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = false;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            gen_config,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"Nexbus - a federated peer-to-peer message bus daemon

USAGE:
    nexbus [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config            Generate an example config on stdout
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    nexbus -c daemon.json
    nexbus --gen-config > daemon.json
"#
    );
}

fn print_version() {
    println!("Nexbus v{}", env!("CARGO_PKG_VERSION"));
    println!("A federated peer-to-peer message bus daemon");
}
