//! CryptoTunnel command-line endpoint
//!
//! `cryptotunnel server [bind-addr]` accepts clients and broadcasts stdin,
//! `cryptotunnel client <server-addr>` connects and sends stdin.
//! Lines starting with `/file <path>` send a file, `/rekey` rotates keys
//! (client only) and `/quit` exits.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use net_transport::{
    ChannelListener, DEFAULT_TUNNEL_PORT, SecureChannelClient, SecureChannelServer, TunnelConfig,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Environment variable naming an optional JSON config file
const CONFIG_ENV: &str = "CRYPTOTUNNEL_CONFIG";

/// Logs everything the tunnel delivers
struct LogListener;

impl ChannelListener for LogListener {
    fn on_message(&self, text: String) {
        info!("Message: {}", text);
    }

    fn on_file_received(&self, path: PathBuf) {
        info!("File received: {}", path.display());
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Message(String),
    File(PathBuf),
    Rekey,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }

    Some(match line.split_once(' ') {
        Some(("/file", path)) if !path.trim().is_empty() => Command::File(PathBuf::from(path.trim())),
        _ if line == "/rekey" => Command::Rekey,
        _ if line == "/quit" => Command::Quit,
        _ => Command::Message(line.to_string()),
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("cryptotunnel=info".parse()?)
                .add_directive("net_transport=info".parse()?),
        )
        .with_thread_names(true)
        .init();

    let config = load_config()?;

    let mut args = std::env::args().skip(1);
    match (args.next().as_deref(), args.next()) {
        (Some("server"), addr) => {
            let addr = addr.unwrap_or_else(|| format!("0.0.0.0:{}", DEFAULT_TUNNEL_PORT));
            run_server(&addr, config)
        }
        (Some("client"), Some(addr)) => run_client(&addr, config),
        _ => bail!("usage: cryptotunnel server [bind-addr] | cryptotunnel client <server-addr>"),
    }
}

fn load_config() -> anyhow::Result<TunnelConfig> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => TunnelConfig::from_json_file(&path)
            .with_context(|| format!("loading {}", PathBuf::from(&path).display())),
        None => Ok(TunnelConfig::default()),
    }
}

fn run_server(addr: &str, config: TunnelConfig) -> anyhow::Result<()> {
    let server = SecureChannelServer::bind(addr, config, Arc::new(LogListener))
        .with_context(|| format!("binding {}", addr))?;
    let accept_loop = server.spawn()?;

    for line in std::io::stdin().lock().lines() {
        match parse_command(&line?) {
            Some(Command::Message(text)) => {
                let delivered = server.broadcast_message(&text);
                info!("Broadcast to {} of {} clients", delivered, server.connection_count());
            }
            Some(Command::File(path)) => {
                let delivered = server.broadcast_file(&path);
                info!("Sent {} to {} clients", path.display(), delivered);
            }
            Some(Command::Rekey) => warn!("Rekey is driven per connection on the server"),
            Some(Command::Quit) => break,
            None => {}
        }
    }

    server.shutdown();
    let _ = accept_loop.join();
    Ok(())
}

fn run_client(addr: &str, config: TunnelConfig) -> anyhow::Result<()> {
    let mut client = SecureChannelClient::connect(addr, config, Arc::new(LogListener))
        .with_context(|| format!("connecting to {}", addr))?;

    for line in std::io::stdin().lock().lines() {
        if !client.is_connected() {
            warn!("Connection to {} lost", client.peer_addr());
            break;
        }

        let result = match parse_command(&line?) {
            Some(Command::Message(text)) => client.send_message(&text),
            Some(Command::File(path)) => client.send_file(&path),
            Some(Command::Rekey) => client.rotate_keys().map(|_| ()),
            Some(Command::Quit) => break,
            None => Ok(()),
        };
        if let Err(e) = result {
            warn!("Send failed: {}", e);
        }
    }

    client.close();
    Ok(())
}
