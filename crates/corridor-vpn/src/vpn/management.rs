//! Management channel for the backend process.
//!
//! The engine binds a listener on loopback and starts the backend in
//! client mode (`--management <addr> <port> --management-client`), so the
//! backend dials back to us. One connection per session; the channel
//! turns the backend's line-oriented output into `ChannelEvent`s.

use crate::vpn::types::*;
use log::{debug, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Greeting the backend prints once the management link is up.
pub const GREETING_MARKER: &str = ">INFO:OpenVPN Management Interface";

/// Fatal payload that means the virtual adapters are claimed or disabled.
pub const ADAPTERS_UNAVAILABLE_MARKER: &str =
    "tap-windows6 adapters on this system are currently in use or disabled";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Channel events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parsed, engine-relevant output from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Management greeting; the engine should send the initial handshake.
    Greeting,
    /// `>STATE:` reports the tunnel established.
    Established,
    /// `>STATE:` reports a SIGTERM-driven exit underway.
    Exiting,
    /// `>STATE:` reports the backend re-establishing.
    Reestablishing,
    /// Physical default gateway learned from the backend's route dump.
    RouteGateway(String),
    /// Tunnel addresses pushed by the server.
    TunnelAddresses { local: String, gateway: String },
    /// Fatal backend report. Terminates parsing for the session.
    Fatal { code: ErrorCode, message: String },
    /// Cumulative traffic totals.
    ByteCount { received: u64, sent: u64 },
    /// The backend closed the channel.
    Eof,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Line assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulates raw reads and yields complete lines. A read may end in
/// the middle of a line; the partial tail is retained for the next push.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: String,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw bytes, returning every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Unterminated tail currently held back.
    pub fn pending(&self) -> &str {
        &self.buf
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Line classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Classify one complete line. Rules apply in priority order; the first
/// match wins. Lines that carry nothing the engine acts on yield `None`.
pub fn classify_line(line: &str) -> Option<ChannelEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if line.contains(GREETING_MARKER) {
        return Some(ChannelEvent::Greeting);
    }

    if line.contains(">STATE:") {
        if line.contains("CONNECTED,SUCCESS") {
            return Some(ChannelEvent::Established);
        }
        if line.contains("EXITING,SIGTERM") {
            return Some(ChannelEvent::Exiting);
        }
        if line.contains("RECONNECTING") {
            return Some(ChannelEvent::Reestablishing);
        }
        return None;
    }

    if line.contains("ROUTE_GATEWAY") {
        return parse_route_gateway(line).map(ChannelEvent::RouteGateway);
    }

    if line.contains("PUSH:") && line.contains("ifconfig") {
        return parse_push_ifconfig(line);
    }

    if line.contains("FATAL") {
        let code = if line.contains(ADAPTERS_UNAVAILABLE_MARKER) {
            ErrorCode::AdapterUnavailable
        } else {
            ErrorCode::UnknownBackendFault
        };
        return Some(ChannelEvent::Fatal {
            code,
            message: line.to_string(),
        });
    }

    if let Some(rest) = line.strip_prefix(">BYTECOUNT:") {
        return match parse_bytecount(rest) {
            Some((received, sent)) => Some(ChannelEvent::ByteCount { received, sent }),
            None => {
                warn!("Malformed byte-count report: {}", line);
                None
            }
        };
    }

    None
}

/// Take the address between the `ROUTE_GATEWAY` marker and the first `/`.
/// A line without a `/` carries no usable gateway.
fn parse_route_gateway(line: &str) -> Option<String> {
    let after = line.split("ROUTE_GATEWAY").nth(1)?;
    if !after.contains('/') {
        return None;
    }
    let addr = after
        .split('/')
        .next()?
        .trim_matches(|c: char| c.is_whitespace() || c == ':' || c == '=');
    if addr.is_empty() {
        None
    } else {
        Some(addr.to_string())
    }
}

/// The pushed reply is comma-separated; the `ifconfig` element carries
/// exactly `ifconfig <local> <gateway>`. Any other arity is ignored.
fn parse_push_ifconfig(line: &str) -> Option<ChannelEvent> {
    let item = line.split(',').find(|part| part.contains("ifconfig"))?;
    let fields: Vec<&str> = item.split_whitespace().collect();
    if fields.len() == 3 {
        Some(ChannelEvent::TunnelAddresses {
            local: fields[1].to_string(),
            gateway: fields[2].to_string(),
        })
    } else {
        None
    }
}

fn parse_bytecount(payload: &str) -> Option<(u64, u64)> {
    let (rx, tx) = payload.split_once(',')?;
    Some((rx.trim().parse().ok()?, tx.trim().parse().ok()?))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Outbound commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Well-known management commands.
pub struct ChannelCommands;

impl ChannelCommands {
    pub const STATE_ON: &'static str = "state on";
    pub const LOG_ON: &'static str = "log on";
    pub const SIGNAL_SIGTERM: &'static str = "signal SIGTERM";

    pub fn bytecount(interval_secs: u32) -> String {
        format!("bytecount {}", interval_secs)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bound but not yet accepted management channel.
pub struct ManagementChannel {
    listener: TcpListener,
    local_addr: SocketAddr,
}

/// Write half of an accepted channel.
#[derive(Debug)]
pub struct CommandSink {
    writer: tokio::io::WriteHalf<TcpStream>,
}

impl ManagementChannel {
    /// Bind an ephemeral loopback listener for the backend to dial.
    pub async fn open() -> Result<Self, VpnError> {
        let listener = TcpListener::bind("127.0.0.1:0").await.map_err(|e| {
            VpnError::new(
                ErrorCode::ManagementChannelFailed,
                "Cannot bind management listener",
            )
            .with_detail(e.to_string())
        })?;
        let local_addr = listener.local_addr().map_err(|e| {
            VpnError::new(
                ErrorCode::ManagementChannelFailed,
                "Cannot read management listener address",
            )
            .with_detail(e.to_string())
        })?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Address to hand to the backend via `--management`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the backend's connection, then split it into a command
    /// sink and an event stream. The reader task classifies lines and
    /// stops at the first fatal report.
    pub async fn accept(
        self,
        timeout: Duration,
    ) -> Result<(CommandSink, mpsc::Receiver<ChannelEvent>), VpnError> {
        let accepted = tokio::time::timeout(timeout, self.listener.accept()).await;
        let (stream, peer) = match accepted {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                return Err(VpnError::new(
                    ErrorCode::ManagementChannelFailed,
                    "Management accept failed",
                )
                .with_detail(e.to_string()))
            }
            Err(_) => {
                return Err(VpnError::new(
                    ErrorCode::ManagementChannelFailed,
                    format!("Backend did not connect within {:?}", timeout),
                ))
            }
        };
        debug!("Backend connected to management channel from {}", peer);

        let (mut reader, writer) = tokio::io::split(stream);
        let (event_tx, event_rx) = mpsc::channel(256);

        tokio::spawn(async move {
            let mut assembler = LineAssembler::new();
            let mut buf = [0u8; 2048];
            'read: loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        let _ = event_tx.send(ChannelEvent::Eof).await;
                        break;
                    }
                    Ok(n) => {
                        for line in assembler.push(&buf[..n]) {
                            match classify_line(&line) {
                                Some(ev) => {
                                    let fatal = matches!(ev, ChannelEvent::Fatal { .. });
                                    if event_tx.send(ev).await.is_err() {
                                        break 'read;
                                    }
                                    if fatal {
                                        break 'read;
                                    }
                                }
                                None => debug!("management: {}", line),
                            }
                        }
                    }
                }
            }
        });

        Ok((CommandSink { writer }, event_rx))
    }
}

impl CommandSink {
    /// Send a raw command, newline-terminated.
    pub async fn send_command(&mut self, cmd: &str) -> Result<(), VpnError> {
        let data = format!("{}\n", cmd);
        self.writer.write_all(data.as_bytes()).await.map_err(|e| {
            VpnError::new(
                ErrorCode::ManagementChannelFailed,
                format!("Failed to send command: {}", cmd),
            )
            .with_detail(e.to_string())
        })
    }

    /// Answer the greeting: stream state and log lines, request
    /// periodic byte counts.
    pub async fn initial_handshake(&mut self, bytecount_interval: u32) -> Result<(), VpnError> {
        self.send_command(ChannelCommands::STATE_ON).await?;
        self.send_command(ChannelCommands::LOG_ON).await?;
        self.send_command(&ChannelCommands::bytecount(bytecount_interval))
            .await
    }

    /// Ask the backend to wind down gracefully.
    pub async fn signal_sigterm(&mut self) -> Result<(), VpnError> {
        self.send_command(ChannelCommands::SIGNAL_SIGTERM).await
    }
}
