use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use relayed::cache::Cache;
use relayed::hosts;
use relayed::net_util::bind_udp;
use relayed::relay::Relay;
use relayed::settings::{Options, Settings};

const DNS_PORT: u16 = 53;

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Clone, Parser)]
/// A recursion-assisting DNS relay.
///
/// relayed answers queries from a hosts table and an in-memory cache,
/// and forwards everything else to a single upstream resolver over
/// UDP.  Hosts-table names mapped to 0.0.0.0 are pollution-shielded:
/// they always answer NXDOMAIN.
///
/// Every option can also be given in a settings file (--config); a
/// flag given on the command line wins.
struct Args {
    /// Interface to listen on
    #[clap(short, long, value_parser, default_value_t = Ipv4Addr::UNSPECIFIED)]
    interface: Ipv4Addr,

    /// Path to a settings file
    #[clap(short, long, value_parser)]
    config: Option<String>,

    /// IPv4 address of the upstream resolver
    #[clap(long, value_parser)]
    remote_host: Option<Ipv4Addr>,

    /// UDP port for the upstream socket, 1024-65535 (0 = OS-assigned)
    #[clap(long, value_parser)]
    client_port: Option<u16>,

    /// 4-bit log mask: 1=debug, 2=info, 4=error, 8=fatal
    #[clap(long, value_parser)]
    log_mask: Option<u8>,

    /// Path to the hosts table
    #[clap(long, value_parser)]
    hosts_path: Option<PathBuf>,

    /// Path to the log file (stderr if unset)
    #[clap(long, value_parser)]
    log_path: Option<PathBuf>,
}

impl From<&Args> for Settings {
    fn from(args: &Args) -> Settings {
        Settings {
            remote_host: args.remote_host,
            client_port: args.client_port,
            log_mask: args.log_mask,
            hosts_path: args.hosts_path.clone(),
            log_path: args.log_path.clone(),
        }
    }
}

fn begin_logging(options: &Options) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.log_filter()));

    if let Some(path) = &options.log_path {
        let file = match std::fs::File::create(path) {
            Ok(file) => file,
            Err(error) => {
                eprintln!("could not open log file {}: {error}", path.display());
                process::exit(1);
            }
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let file_settings = match &args.config {
        Some(path) => match Settings::from_file(path) {
            Ok(settings) => settings,
            Err(error) => {
                eprintln!("could not load settings file: {error}");
                process::exit(1);
            }
        },
        None => Settings::default(),
    };

    let options = match file_settings.overlay(Settings::from(&args)).finalise() {
        Ok(options) => options,
        Err(error) => {
            eprintln!("invalid configuration: {error}");
            process::exit(1);
        }
    };

    begin_logging(&options);

    let hosts_data = match tokio::fs::read_to_string(&options.hosts_path).await {
        Ok(data) => data,
        Err(error) => {
            tracing::error!(path = ?options.hosts_path, %error, "could not read hosts file");
            process::exit(1);
        }
    };
    let entries = match hosts::deserialise(&hosts_data) {
        Ok(entries) => entries,
        Err(error) => {
            tracing::error!(path = ?options.hosts_path, %error, "could not parse hosts file");
            process::exit(1);
        }
    };
    tracing::info!(entries = %entries.len(), "hosts table loaded");
    let cache = Cache::new(entries);

    tracing::info!(interface = %args.interface, port = %DNS_PORT, "binding downstream UDP socket");
    let downstream = match bind_udp(SocketAddrV4::new(args.interface, DNS_PORT), false) {
        Ok(socket) => Arc::new(socket),
        Err(error) => {
            tracing::error!(%error, "could not bind downstream UDP socket");
            process::exit(1);
        }
    };

    tracing::info!(port = %options.client_port, "binding upstream UDP socket");
    let upstream = match bind_udp(
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, options.client_port),
        true,
    ) {
        Ok(socket) => Arc::new(socket),
        Err(error) => {
            tracing::error!(%error, "could not bind upstream UDP socket");
            process::exit(1);
        }
    };

    let upstream_addr = SocketAddr::V4(SocketAddrV4::new(options.remote_host, DNS_PORT));
    tracing::info!(upstream = %upstream_addr, "starting relay");

    let (relay, timeout_rx) = Relay::new(cache, downstream, upstream, upstream_addr);
    tokio::spawn(relay.run(timeout_rx));

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, "could not subscribe to SIGTERM");
            process::exit(1);
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => (),
        _ = sigterm.recv() => (),
    }
    tracing::info!("shutting down");
}
