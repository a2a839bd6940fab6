//! `geotrace`: trace the route to a host, hop by hop.

use clap::{Parser, ValueEnum};
use geotrace_core::{CancellationMonitor, EngineConfig, GeoPoint, Hop, TraceError, TraceSpec};
use geotrace_engine::{HickoryDnsResolver, RouteEngine, RouteListener};
use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Csv,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "geotrace", about = "Discover the network route to a host")]
struct Cli {
    /// Destination hostname, IP address, or URL.
    target: String,

    /// Maximum number of hops to probe.
    #[arg(long, default_value_t = 30)]
    max_hops: u8,

    /// Overall trace budget in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Use the system traceroute utility instead of embedded probing.
    #[arg(long)]
    os_probe: bool,

    /// Probe over IPv6 (implies the system traceroute utility).
    #[arg(long)]
    ipv6: bool,

    /// Do not reverse-resolve hop hostnames.
    #[arg(short, long)]
    numeric: bool,

    /// Report format printed after the trace finishes.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

/// How the trace ended, as observed by the listener.
#[derive(Debug)]
enum Terminal {
    Done,
    Timeout,
    MaxHops,
    Cancelled,
    Error(String),
}

/// Streams hops to stdout as they arrive and forwards the terminal
/// event to the main task.
struct PrintListener {
    terminal: mpsc::UnboundedSender<Terminal>,
}

impl RouteListener for PrintListener {
    fn new_route(&self, _resolve_hostname: bool) {
        eprintln!("tracing route...");
    }

    fn route_point_added(&self, hop: &Hop) {
        let host = match (&hop.hostname, hop.synthetic_unknown) {
            (_, true) => "*".to_string(),
            (Some(name), _) => format!("{} ({})", name, hop.ip),
            (None, _) => hop.ip.to_string(),
        };
        let place = match (&hop.geo.town, &hop.geo.country) {
            (Some(town), Some(country)) => format!("  [{town}, {country}]"),
            (None, Some(country)) => format!("  [{country}]"),
            _ => String::new(),
        };
        println!("{:>3}  {}  {} ms{}", hop.number, host, hop.latency_ms, place);
    }

    fn route_done(&self, elapsed_ms: u64, total_distance_km: f64) {
        eprintln!("done in {elapsed_ms} ms, {total_distance_km:.1} km traveled");
        let _ = self.terminal.send(Terminal::Done);
    }

    fn route_timeout(&self) {
        eprintln!("trace timed out");
        let _ = self.terminal.send(Terminal::Timeout);
    }

    fn max_hops(&self) {
        eprintln!("hop budget exhausted before reaching the destination");
        let _ = self.terminal.send(Terminal::MaxHops);
    }

    fn route_cancelled(&self) {
        eprintln!("trace cancelled");
        let _ = self.terminal.send(Terminal::Cancelled);
    }

    fn error(&self, error: &TraceError, origin: &str) {
        let _ = self
            .terminal
            .send(Terminal::Error(format!("{origin}: {error}")));
    }
}

/// Placeholder enricher for environments without a geo backend; every
/// hop is reported as unlocated.
struct UnknownGeo;

impl geotrace_core::GeoEnricher for UnknownGeo {
    fn resolve(&self, _ip: IpAddr) -> GeoPoint {
        GeoPoint::unresolved()
    }
    fn local_public(&self) -> GeoPoint {
        GeoPoint::unresolved()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "geotrace=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let engine = RouteEngine::new(
        EngineConfig::default(),
        Arc::new(UnknownGeo),
        Arc::new(HickoryDnsResolver::new()),
    );

    let (terminal_tx, mut terminal_rx) = mpsc::unbounded_channel();
    engine.add_listener(Arc::new(PrintListener {
        terminal: terminal_tx,
    }));

    let spec = TraceSpec {
        destination: cli.target.clone(),
        max_hops: cli.max_hops,
        timeout: cli.timeout_ms.map(Duration::from_millis),
        resolve_hostname: !cli.numeric,
        use_os_probe: cli.os_probe,
        ipv4: !cli.ipv6,
    };

    let monitor = CancellationMonitor::new();
    let ctrl_c_monitor = monitor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupt received, cancelling trace");
            ctrl_c_monitor.cancel();
        }
    });

    let job = match engine.compute(spec, monitor).await {
        Ok(job) => job,
        Err(e) => {
            eprintln!("geotrace: {e}");
            return ExitCode::from(1);
        }
    };

    let terminal = terminal_rx.recv().await.unwrap_or(Terminal::Cancelled);
    job.wait().await;

    match cli.format {
        OutputFormat::Text => {
            // Hops were already streamed; nothing more for text mode.
        }
        OutputFormat::Csv => print!("{}", engine.to_csv()),
        OutputFormat::Json => match engine.report().to_json() {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("geotrace: {e}"),
        },
    }

    match terminal {
        Terminal::Done => ExitCode::SUCCESS,
        Terminal::Error(message) => {
            eprintln!("geotrace: {message}");
            ExitCode::from(1)
        }
        Terminal::MaxHops => ExitCode::from(2),
        Terminal::Timeout => ExitCode::from(3),
        Terminal::Cancelled => ExitCode::from(130),
    }
}
