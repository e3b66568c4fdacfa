//! Startup banner.

use std::fmt::Write;

use crate::config::Config;
use crate::tunables::Tunables;

/// Print a startup summary to stdout.
pub fn print_banner(config: &Config, tunables: &Tunables) {
    let name = "strata-server";
    let version = env!("CARGO_PKG_VERSION");

    let mut out = String::with_capacity(512);
    writeln!(out, "{name} v{version}").unwrap();
    writeln!(out, "{}", "=".repeat(name.len() + version.len() + 2)).unwrap();
    writeln!(out).unwrap();
    writeln!(out, "Listener:         {}", config.server.address).unwrap();
    writeln!(out, "Reactor workers:  {}", config.threads()).unwrap();
    writeln!(out, "Executor threads: {}", config.server.executor_threads).unwrap();
    writeln!(out).unwrap();
    writeln!(out, "Client limits:").unwrap();
    writeln!(out, "  Pending ops:     {}", tunables.max_pending_ops()).unwrap();
    writeln!(out, "  Pending bytes:   {}", tunables.max_pending_bytes()).unwrap();
    writeln!(out, "  Read-ahead:      {}", tunables.max_read_ahead()).unwrap();
    writeln!(out, "  Write-behind:    {}", tunables.max_write_behind()).unwrap();
    writeln!(out, "  Idle timeout:    {}s", tunables.inactivity_timeout()).unwrap();
    writeln!(
        out,
        "  Audit logging:   {}",
        if tunables.audit_logging() { "on" } else { "off" }
    )
    .unwrap();
    writeln!(out).unwrap();
    print!("{out}");
}
