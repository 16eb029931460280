//! Peerchat node
//!
//! Runs a chat node on this machine and reads commands from stdin.
//!
//! Usage:
//!   peerchat-node --username alice --mac aa:bb:cc:dd:ee:ff [--listen 0.0.0.0:4242]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use peerchat::{ContactBook, FriendRequest, NodeConfig, PeerId, ProtocolKind, Server, TcpTransport};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Peer-to-peer encrypted chat node
#[derive(Parser)]
#[command(name = "peerchat-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Port assumed for peers that contact us first
    #[arg(long)]
    peer_port: Option<u16>,

    /// Local username
    #[arg(short, long)]
    username: Option<String>,

    /// Hardware address of this machine
    #[arg(short, long)]
    mac: Option<String>,

    /// Contacts file (default: ~/.peerchat/contacts.json)
    #[arg(long)]
    contacts: Option<PathBuf>,
}

fn load_config(args: Args) -> NodeConfig {
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path).unwrap_or_else(|e| {
            eprintln!("{}", e);
            std::process::exit(1);
        }),
        None => NodeConfig::default(),
    };

    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(port) = args.peer_port {
        config.peer_port = port;
    }
    if let Some(username) = args.username {
        config.username = username;
    }
    if let Some(mac) = args.mac {
        config.mac = mac;
    }
    if args.contacts.is_some() {
        config.contacts_path = args.contacts;
    }

    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
    config
}

fn load_contacts(config: &NodeConfig) -> ContactBook {
    let path = match &config.contacts_path {
        Some(path) => path.clone(),
        None => ContactBook::default_path().unwrap_or_else(|e| {
            eprintln!("{}", e);
            std::process::exit(1);
        }),
    };
    ContactBook::load(&path).unwrap_or_else(|e| {
        eprintln!("Failed to load contacts from {}: {}", path.display(), e);
        std::process::exit(1);
    })
}

fn print_help() {
    println!("Commands:");
    println!("  /start <name> [ratchet|plain]      - Start a session with a friend");
    println!("  /msg <name> <text>                 - Send an encrypted chat line");
    println!("  /friend <addr> <username> <name>   - Ask a node for friendship");
    println!("  /requests                          - List pending friend requests");
    println!("  /accept <index> <name>             - Accept a friend request");
    println!("  /reject <index>                    - Reject a friend request");
    println!("  /friends                           - List friends");
    println!("  /quit                              - Exit");
}

async fn pick_request(server: &Server, index: &str) -> Option<FriendRequest> {
    let pending = server.pending_friend_requests().await;
    let found = index
        .parse::<usize>()
        .ok()
        .and_then(|i| pending.get(i).cloned());
    if found.is_none() {
        println!("No request #{}. Use /requests to list them.", index);
    }
    found
}

/// Run one command line. Returns false when the node should exit.
async fn run_command(server: &Server, line: &str) -> bool {
    let mut parts = line.splitn(2, ' ');
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();

    match command {
        "/start" => {
            let mut args = rest.split_whitespace();
            let Some(name) = args.next() else {
                println!("Usage: /start <name> [ratchet|plain]");
                return true;
            };
            let kind = match args.next().map(str::parse::<ProtocolKind>) {
                None => ProtocolKind::default(),
                Some(Ok(kind)) => kind,
                Some(Err(e)) => {
                    println!("{}", e);
                    return true;
                }
            };
            match server.start_session(name, kind).await {
                Ok(true) => println!("Handshake with {} started", name),
                Ok(false) => println!("Already have a session with {}", name),
                Err(e) => println!("Error: {}", e),
            }
        }
        "/msg" => {
            let Some((name, text)) = rest.split_once(' ') else {
                println!("Usage: /msg <name> <text>");
                return true;
            };
            if let Err(e) = server.send_chat(name, text.as_bytes()).await {
                println!("Error: {}", e);
            }
        }
        "/friend" => {
            let args: Vec<&str> = rest.split_whitespace().collect();
            let [addr, username, name] = args.as_slice() else {
                println!("Usage: /friend <addr> <username> <name>");
                return true;
            };
            let addr = match addr.parse::<SocketAddr>() {
                Ok(addr) => addr,
                Err(e) => {
                    println!("Invalid address {}: {}", addr, e);
                    return true;
                }
            };
            match server.send_friend_request(addr, username, name).await {
                Ok(()) => println!("Friend request sent to {}", addr),
                Err(e) => println!("Error: {}", e),
            }
        }
        "/requests" => {
            let pending = server.pending_friend_requests().await;
            if pending.is_empty() {
                println!("No pending friend requests");
            }
            for (i, request) in pending.iter().enumerate() {
                println!("  #{} {} from {}", i, request.peer, request.ip);
            }
        }
        "/accept" => {
            let Some((index, name)) = rest.split_once(' ') else {
                println!("Usage: /accept <index> <name>");
                return true;
            };
            if let Some(request) = pick_request(server, index).await {
                if let Err(e) = server.accept_friend_request(&request.peer, name.trim()).await {
                    println!("Error: {}", e);
                }
            }
        }
        "/reject" => {
            if let Some(request) = pick_request(server, rest).await {
                server.reject_friend_request(&request.peer).await;
                println!("Rejected {}", request.peer);
            }
        }
        "/friends" => {
            for contact in server.friends().await {
                println!("  {} ({}) at {}", contact.display_name, contact.peer, contact.addr);
            }
        }
        "/help" => print_help(),
        "/quit" => return false,
        _ => println!("Unknown command. Use /help for a list."),
    }
    true
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("peerchat=info")),
        )
        .init();

    let config = load_config(Args::parse());
    let contacts = load_contacts(&config);
    let identity = PeerId::new(config.mac.clone(), config.username.clone());

    let (server, mut events) = Server::new(config, contacts, Arc::new(TcpTransport::new()));
    if let Err(e) = server.start().await {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    println!("=== Peerchat node for {} ===", identity);
    println!("Reachable at {}", server.local_addr());
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = events.recv() => println!("{}", event),
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if !run_command(&server, line).await {
                    break;
                }
            }
        }
    }

    info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "peerchat-node",
            "--username",
            "alice",
            "--mac",
            "aa:bb",
            "--listen",
            "127.0.0.1:5000",
        ]);
        let config = load_config(args);
        assert_eq!(config.username, "alice");
        assert_eq!(config.listen.port(), 5000);
        assert_eq!(config.peer_port, peerchat::config::DEFAULT_PORT);
    }
}
