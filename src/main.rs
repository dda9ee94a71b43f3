//! Palaver chat server
//!
//! Multi-room chat backend speaking a newline-delimited JSON protocol
//! over TCP.
//!
//! Usage:
//!   cargo run -- server                    # Run the chat server
//!   cargo run -- server --port 7878       # Run on a specific port

use std::env;
use std::sync::Arc;

use palaver::{ChatConfig, ChatServer, MemoryStore};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "server" => {
            run_server(&args).await?;
        }
        "help" | "--help" | "-h" => {
            print_usage();
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

async fn run_server(args: &[String]) -> anyhow::Result<()> {
    let mut config = ChatConfig::default();
    if let Some(port) = parse_flag(args, "--port") {
        config.bind_addr.set_port(port);
    }
    if let Some(max) = parse_flag(args, "--max-conn") {
        config.max_connections = max;
    }

    let store = Arc::new(MemoryStore::new());
    let server = ChatServer::bind(config, store).await?;
    info!("chat server ready on {}", server.local_addr()?);
    server.run().await?;
    Ok(())
}

fn print_usage() {
    println!("Palaver - Multi-Room Chat Server");
    println!();
    println!("USAGE:");
    println!("    cargo run -- server [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    server              Start the chat server");
    println!("    help                Show this help message");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>       Port to listen on (default: 7878)");
    println!("    --max-conn <NUM>    Maximum connections (default: 1000)");
    println!();
    println!("PROTOCOL:");
    println!("    One JSON record per line, each with a \"type\" field:");
    println!("    - join: bind the connection to a user and room (first record)");
    println!("    - chat_message / typing / read_receipt / catch_up: room events");
    println!("    - Server pushes chat_message, read_receipt, bulk_read,");
    println!("      presence, and lobby notification records");
    println!();
    println!("EXAMPLES:");
    println!("    cargo run -- server");
    println!("    cargo run -- server --port 9000");
    println!("    RUST_LOG=debug cargo run -- server");
}

fn parse_flag<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    for i in 0..args.len() {
        if args[i] == flag && i + 1 < args.len() {
            if let Ok(value) = args[i + 1].parse() {
                return Some(value);
            }
        }
    }
    None
}
