//! strata metadata server binary.

use std::path::PathBuf;

use clap::Parser;

use server::banner::print_banner;
use server::config::Config;
use server::tunables::TUNABLES;

#[derive(Parser)]
#[command(name = "strata-server")]
#[command(about = "Distributed-file-system metadata server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    server::logging::init(&config.logging);
    // Banner wants the effective limits, so apply tunables before printing.
    TUNABLES.update(&config.client, false, config.threads());
    print_banner(&config, &TUNABLES);

    let shutdown = server::signal::install_signal_handler();
    if let Err(e) = server::run(&config, shutdown) {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}

fn print_default_config() {
    let config = r#"# strata server configuration

[server]
# Address the client listener binds
address = "0.0.0.0:20000"
backlog = 1024

# Reactor worker threads (default: number of CPUs)
# worker_threads = 4

# Request executor threads
executor_threads = 2

# How long shutdown waits for connections to drain
drain_timeout_secs = 10

[client]
# Max requests one connection may have in flight.
# Defaults to 16 when multiple reactor workers are configured.
# max_pending_ops = 16

# Input-buffer bytes at which read-ahead is suspended
max_pending_bytes = 3072

# Read-ahead ceiling in bytes
max_read_ahead = 3072

# Idle seconds before close; 0 or negative disables the timer
inactivity_timeout = 480

# Queued output bytes at which request extraction pauses
max_write_behind = 3072

# Buffer compaction thresholds in bytes
in_buf_compaction_threshold = 1024
out_buf_compaction_threshold = 8192

# Retain raw request headers and emit audit records
audit_logging = false
audit_max_record_bytes = 1024

[logging]
# Level filter when RUST_LOG is unset
level = "info"
# "compact" or "json"
format = "compact"
timestamps = true
"#;
    print!("{config}");
}
