use clap::Parser;
use radproxy_server::{logging, Config, Proxy};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

/// Realm-routing RADIUS/RadSec proxy
#[derive(Parser, Debug)]
#[command(name = "radproxy", disable_version_flag = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short = 'c', value_name = "CONFIG", default_value = "/etc/radproxy.conf")]
    config: PathBuf,

    /// Debug level: 1=error, 2=warn, 3=info, 4=debug, 5=trace
    #[arg(short = 'd', value_name = "LEVEL", value_parser = clap::value_parser!(u8).range(1..=5))]
    debug: Option<u8>,

    /// Run in the foreground, logging to stderr
    #[arg(short = 'f')]
    foreground: bool,

    /// Write the process id to this file
    #[arg(short = 'i', value_name = "PIDFILE")]
    pid_file: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(short = 'p')]
    pretend: bool,

    /// Print version information and exit
    #[arg(short = 'v')]
    version: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("radproxy {}", env!("CARGO_PKG_VERSION"));
        process::exit(0);
    }

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{}: {error}", cli.config.display());
            process::exit(1);
        }
    };

    if cli.pretend {
        println!("configuration OK");
        println!("  clients: {}", config.clients.len());
        println!("  servers: {}", config.servers.len());
        println!("  realms:  {}", config.realms.len());
        process::exit(0);
    }

    let level = match cli.debug {
        Some(debug) => logging::level_for(debug),
        None => config.log_level.as_deref().unwrap_or("info"),
    };
    let destination = if cli.foreground {
        None
    } else {
        config.log_destination.as_ref().map(PathBuf::from)
    };
    let log = match logging::init(level, destination.as_deref()) {
        Ok(log) => log,
        Err(error) => {
            eprintln!("cannot open log destination: {error}");
            process::exit(1);
        }
    };

    if let Some(path) = cli.pid_file.or_else(|| config.pid_file.as_ref().map(PathBuf::from)) {
        if let Err(error) = std::fs::write(&path, format!("{}\n", process::id())) {
            error!(path = %path.display(), %error, "cannot write pid file");
            process::exit(1);
        }
    }

    info!("radproxy {} starting", env!("CARGO_PKG_VERSION"));
    let proxy = match Proxy::new(&config).await {
        Ok(proxy) => proxy,
        Err(error) => {
            error!(%error, "startup failed");
            process::exit(1);
        }
    };

    if let Err(error) = proxy.run(log).await {
        error!(%error, "proxy failed");
        process::exit(1);
    }
}
