//! Chatlink terminal client.
//!
//! Logs into a chatlink server, keeps the session alive across disconnects and
//! relays messages between stdin/stdout and the server.

use anyhow::Context;
use chatlink_session::{
    ConnectionState, ContactSync, HandlerContext, KeepaliveScheduler, LinkError, LoggingStateObserver,
    ManagedConnection, ObserverChain, PasswordLogin, StateObserver, TcpTransport, TimedKeyRefresh, Transport,
};
use chatlink_wire::{Packet, PacketKind};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod repl;

use config::ClientConfig;
use logging::ChatlinkLogFormatter;
use repl::{Command, HELP};

// Component logging macros are defined in logging.rs and available via #[macro_export]

#[cfg(feature = "tls")]
use chatlink_session::{make_client_config, TlsClientConfig};

/// Chatlink terminal client
#[derive(Parser, Debug)]
#[command(name = "chatlink", version, about = "Terminal client for chatlink servers")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "chatlink.yaml")]
    config: PathBuf,

    /// Server address, e.g. chat.example.org:7070
    #[arg(long)]
    server: Option<String>,

    /// Account to log in as
    #[arg(long)]
    account: Option<String>,

    /// Account password
    #[arg(long, env = "CHATLINK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Reconnect attempts before giving up on a wait
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Pause between reconnects, e.g. 3s
    #[arg(long)]
    reconnect_delay: Option<humantime::Duration>,

    /// Log every reconnect decision
    #[arg(long)]
    selector_logging: bool,

    /// Heartbeat interval, e.g. 60s
    #[arg(long)]
    heartbeat_interval: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable TLS
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate file (PEM format)
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Server name for TLS SNI
    #[arg(long)]
    tls_sni: Option<String>,
}

impl Args {
    /// Command line flags take precedence over file and environment
    fn apply_to(&self, config: &mut ClientConfig) {
        if let Some(server) = &self.server {
            config.server = server.clone();
        }
        if let Some(account) = &self.account {
            config.account = account.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(attempts) = self.max_attempts.filter(|a| *a > 0) {
            config.selector.max_attempts = Some(attempts);
        }
        if let Some(delay) = self.reconnect_delay {
            config.selector.reconnect_delay = delay.into();
        }
        if self.selector_logging {
            config.selector.logging = true;
        }
        if let Some(interval) = self.heartbeat_interval {
            config.heartbeat.interval = interval.into();
        }
        if self.tls {
            config.tls.enabled = true;
        }
        if let Some(ca) = &self.tls_ca {
            config.tls.ca_file = ca.display().to_string();
        }
        if let Some(sni) = &self.tls_sni {
            config.tls.server_name = sni.clone();
        }
    }
}

#[derive(Debug, Serialize)]
struct OutgoingMessage<'a> {
    target: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    #[serde(default)]
    from: String,
    #[serde(default)]
    text: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("chatlink={}", args.log_level).parse()?)
        .add_directive(format!("chatlink_session={}", args.log_level).parse()?)
        .add_directive(format!("chatlink_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(ChatlinkLogFormatter::new("chatlink"))
        .init();

    info!("Starting chatlink v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ClientConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);
    config.validate()?;

    let transport = build_transport(&config).await?;
    let sync = Arc::new(ContactSync::new(config.request_timeout));
    let login = PasswordLogin::new(config.account.clone(), config.password.clone(), config.request_timeout);

    let mut context = HandlerContext::new(config.server.clone(), transport, Arc::new(login))
        .with_sync(sync.clone())
        .with_heartbeat(Arc::new(KeepaliveScheduler::new(
            config.heartbeat.interval,
            config.heartbeat.timeout,
        )))
        .with_packet_handler(Arc::new(print_incoming))
        .with_observer(Arc::new(
            ObserverChain::new()
                .with(Arc::new(LoggingStateObserver))
                .with(Arc::new(StatusLine)),
        ));
    if config.key_refresh.enabled {
        context = context.with_key_refresh(Arc::new(TimedKeyRefresh::new(
            config.key_refresh.interval,
            config.request_timeout,
        )));
    }

    let connection = Arc::new(ManagedConnection::new(Arc::new(context), config.selector_config()));

    component_info!("session", "Connecting to {} as {}", config.server, config.account);
    if let Err(e) = connection.resume().await {
        component_error!("session", "Could not log in: {}", e);
        connection.close(None);
        return Err(e).context("login failed");
    }
    println!("Logged in as {}. Type /help for commands.", config.account);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_target: Option<String> = None;

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                component_info!("repl", "Interrupted");
                break;
            }
            line = lines.next_line() => line.context("failed to read stdin")?,
        };
        let Some(line) = line else {
            break;
        };

        match Command::parse(&line) {
            Command::Empty => {}
            Command::Send { target, text } => {
                if target.is_some() {
                    last_target = target;
                }
                match &last_target {
                    Some(target) => spawn_send(&connection, &config, target.clone(), text),
                    None => println!("No target yet, use /send <target> <text>"),
                }
            }
            Command::State => println!("{}", connection.state()),
            Command::Contacts => match sync.latest() {
                Some(snapshot) => {
                    for friend in &snapshot.friends {
                        println!("friend {:>10}  {}", friend.id, friend.name);
                    }
                    for group in &snapshot.groups {
                        println!("group  {:>10}  {} ({} members)", group.id, group.name, group.members);
                    }
                }
                None => println!("Not synchronized yet"),
            },
            Command::Reconnect => {
                connection.close(Some(LinkError::recoverable("reconnect requested")));
                let connection = Arc::clone(&connection);
                tokio::spawn(async move {
                    if let Err(e) = connection.resume().await {
                        component_warn!("session", "Reconnect failed: {}", e);
                    }
                });
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => break,
            Command::Unknown(input) => println!("Unknown command '{}', try /help", input),
        }
    }

    component_info!("session", "Logging out");
    connection.shutdown(config.request_timeout).await;
    Ok(())
}

async fn build_transport(config: &ClientConfig) -> anyhow::Result<Arc<dyn Transport>> {
    let transport = TcpTransport::new(config.connect_timeout);

    if !config.tls.enabled {
        return Ok(Arc::new(transport));
    }

    #[cfg(not(feature = "tls"))]
    {
        anyhow::bail!("TLS requested but not compiled with TLS support. Build with --features tls");
    }

    #[cfg(feature = "tls")]
    {
        let ca_path = &config.tls.ca_file;
        info!("Loading TLS configuration from ca={:?}", ca_path);
        let ca_pem = tokio::fs::read_to_string(ca_path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read CA file {:?}: {}", ca_path, e))?;

        let tls = TlsClientConfig {
            client_config: Arc::new(make_client_config(&ca_pem)?),
            server_name: config.tls_server_name(),
        };
        info!("TLS configuration loaded successfully (SNI: {})", tls.server_name);
        Ok(Arc::new(transport.with_tls(tls)))
    }
}

fn spawn_send(connection: &Arc<ManagedConnection>, config: &ClientConfig, target: String, text: String) {
    let connection = Arc::clone(connection);
    let timeout = config.request_timeout;
    tokio::spawn(async move {
        let body = match serde_json::to_vec(&OutgoingMessage {
            target: &target,
            text: &text,
        }) {
            Ok(body) => body,
            Err(e) => {
                component_error!("repl", "Failed to encode message: {}", e);
                return;
            }
        };

        let packet = Packet::request("message.send", connection.next_sequence(), body);
        match connection.send_and_expect(packet, timeout, 2).await {
            Ok(_) => component_debug!("repl", "Delivered message to {}", target),
            Err(e) => println!("! message to {} failed: {}", target, e),
        }
    });
}

/// Tells the user on stdout when the session goes online or drops
struct StatusLine;

impl StatusLine {
    fn describe(previous: ConnectionState, new: ConnectionState) -> Option<&'static str> {
        match (previous, new) {
            (_, ConnectionState::Ok) => Some("* online"),
            (ConnectionState::Loading | ConnectionState::Ok, ConnectionState::Closed) => Some("* connection lost"),
            _ => None,
        }
    }
}

impl StateObserver for StatusLine {
    fn state_changed(&self, _handler_id: u64, previous: ConnectionState, new: ConnectionState) {
        if let Some(line) = Self::describe(previous, new) {
            println!("{}", line);
        }
    }
}

/// Prints `message.push` packets, everything else goes to the debug log
fn print_incoming(packet: Packet) {
    if packet.kind != PacketKind::Push || packet.command != "message.push" {
        component_debug!(
            "repl",
            "Ignoring {:?} packet '{}' (seq {})",
            packet.kind,
            packet.command,
            packet.sequence_id
        );
        return;
    }

    match serde_json::from_slice::<IncomingMessage>(&packet.body) {
        Ok(message) => println!("<{}> {}", message.from, message.text),
        Err(e) => component_warn!("repl", "Malformed message push: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "chatlink",
            "--server",
            "10.1.1.1:7070",
            "--account",
            "carol",
            "--max-attempts",
            "3",
            "--reconnect-delay",
            "250ms",
            "--tls-sni",
            "chat.internal",
        ]);

        let mut config = ClientConfig::default();
        args.apply_to(&mut config);
        assert_eq!(config.server, "10.1.1.1:7070");
        assert_eq!(config.account, "carol");
        assert_eq!(config.selector.max_attempts, Some(3));
        assert_eq!(config.selector.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.tls_server_name(), "chat.internal");
        assert!(!config.tls.enabled);
    }

    #[test]
    fn test_status_line_reports_online_and_drops() {
        use ConnectionState as S;
        assert_eq!(StatusLine::describe(S::Loading, S::Ok), Some("* online"));
        assert_eq!(StatusLine::describe(S::Ok, S::Closed), Some("* connection lost"));
        assert_eq!(StatusLine::describe(S::Connecting, S::Closed), None);
        assert_eq!(StatusLine::describe(S::Initialized, S::Connecting), None);
    }

    #[test]
    fn test_outgoing_message_body() {
        let body = serde_json::to_string(&OutgoingMessage {
            target: "bob",
            text: "hi",
        })
        .unwrap();
        assert_eq!(body, r#"{"target":"bob","text":"hi"}"#);
    }
}
