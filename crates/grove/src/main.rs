//! The grove launcher binary.
//!
//! `grove host1 host2 … hostN` starts a job across this host (rank 0)
//! and the listed hosts. Each listed host gets one spawn process,
//! launched through the remote shell and connected back into a k-ary
//! tree; application processes and rendezvous behavior are controlled
//! by `SPAWN_*` environment variables read here at the root.
//!
//! A spawn process launched by a parent runs this same binary with
//! `SPAWN_PARENT` and `SPAWN_ID` in its environment and no arguments.

use clap::Parser;

use grove_session::Session;

/// Tree-structured launcher for distributed parallel jobs.
#[derive(Parser)]
#[command(name = "grove", version)]
struct Cli {
    /// Hosts to spawn on; this host is rank 0 and each listed host
    /// gets the next rank in order.
    #[arg(value_name = "HOST")]
    hosts: Vec<String>,
}

fn main() {
    let argv0 = std::env::args()
        .next()
        .unwrap_or_else(|| "grove".to_string());
    let cli = Cli::parse();

    // Diagnostics go to stderr with timestamps and source locations;
    // stdout is reserved for the parameter/timing reports.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(&cli.hosts, &argv0) {
        let host = grove_net::tcp::local_hostname().unwrap_or_else(|_| "unknown".to_string());
        tracing::error!(
            program = "grove",
            host,
            pid = std::process::id(),
            %err,
            "fatal"
        );
        std::process::exit(1);
    }
}

fn run(hosts: &[String], argv0: &str) -> grove_common::Result<()> {
    let mut session = Session::init(hosts, argv0)?;
    session.run()
}
