//! tendril-ctl: command-line interface for the Tendril daemon.

use anyhow::{Context, Result};

mod cmd;

const DEFAULT_PORT: u16 = 4433;

fn print_usage() {
    println!("Usage: tendril-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status    Show node, reconnect and last health check");
    println!("  peers     List the mesh table");
    println!("  connect   Ask the access gateway for a connection now");
    println!();
    println!("Options:");
    println!("  --port <port>   Status endpoint port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | []                => cmd::status::cmd_status(port).await,
        ["peers"]                      => cmd::status::cmd_peers(port).await,
        ["connect"]                    => cmd::status::cmd_connect(port).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
