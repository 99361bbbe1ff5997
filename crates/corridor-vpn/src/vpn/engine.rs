//! Backend engine: owns one tunnel session end to end.
//!
//! The engine supervises the backend process (spawned across the
//! privilege boundary), the management channel, and the connect-timeout
//! timer as one unit: they are created together on `start` and released
//! together on `stop` or failure. Every state transition funnels through
//! `set_state`, which also emits the ordered event stream observers
//! consume.

use crate::vpn::adapter::GatewayAddressResolver;
use crate::vpn::ipc::{ElevatedProcess, PrivilegedServiceClient};
use crate::vpn::management::{ChannelCommands, ChannelEvent, CommandSink, ManagementChannel};
use crate::vpn::types::*;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the engine for a protocol. The variant set is closed: an
/// unimplemented protocol is a typed refusal, not a runtime lookup miss.
pub fn build_engine(
    protocol: Protocol,
    settings: EngineSettings,
) -> Result<(Arc<OpenVpnEngine>, mpsc::UnboundedReceiver<EngineEvent>), VpnError> {
    match protocol {
        Protocol::OpenVpn => Ok(OpenVpnEngine::new(settings)),
        Protocol::WireGuard => Err(VpnError::new(
            ErrorCode::NotImplemented,
            format!("No engine registered for {}", protocol),
        )),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
struct Session {
    process: ElevatedProcess,
    config_path: PathBuf,
}

/// OpenVPN-style backend engine.
#[derive(Debug)]
pub struct OpenVpnEngine {
    me: Weak<OpenVpnEngine>,
    settings: EngineSettings,
    client: PrivilegedServiceClient,
    resolver: GatewayAddressResolver,
    state: RwLock<ConnectionState>,
    last_error: RwLock<Option<VpnError>>,
    counters: RwLock<ByteCounters>,
    gateway: RwLock<GatewayInfo>,
    server_addr: RwLock<Option<IpAddr>>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
    session: Mutex<Option<Session>>,
    sink: Mutex<Option<CommandSink>>,
    timeout_cancel: Mutex<Option<oneshot::Sender<()>>>,
    /// Bumped whenever a session ends; stale tasks compare and bail.
    generation: AtomicU64,
    /// Set during an intentional stop so channel EOF is not a failure.
    stopping: AtomicBool,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl OpenVpnEngine {
    pub fn new(
        settings: EngineSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let client =
            PrivilegedServiceClient::new(settings.service_addr, settings.service_timeout);
        let engine = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            settings,
            client,
            resolver: GatewayAddressResolver::new(),
            state: RwLock::new(ConnectionState::Unknown),
            last_error: RwLock::new(None),
            counters: RwLock::new(ByteCounters::default()),
            gateway: RwLock::new(GatewayInfo::default()),
            server_addr: RwLock::new(None),
            connected_at: RwLock::new(None),
            session: Mutex::new(None),
            sink: Mutex::new(None),
            timeout_cancel: Mutex::new(None),
            generation: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            events: event_tx,
        });
        (engine, event_rx)
    }

    // ── Observers ────────────────────────────────────────────────

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Retained until the next session starts.
    pub async fn last_error(&self) -> Option<VpnError> {
        self.last_error.read().await.clone()
    }

    pub async fn counters(&self) -> ByteCounters {
        *self.counters.read().await
    }

    pub async fn gateway_info(&self) -> GatewayInfo {
        self.gateway.read().await.clone()
    }

    pub async fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self.connected_at.read().await
    }

    // ── State funnel ─────────────────────────────────────────────

    async fn set_state(&self, next: ConnectionState) {
        let was_connected = {
            let mut state = self.state.write().await;
            if *state == next {
                return;
            }
            debug!("Connection state: {} -> {}", state, next);
            let was_connected = *state == ConnectionState::Connected;
            *state = next;
            was_connected
        };
        // Addressing facts are only valid while the tunnel is up.
        if was_connected {
            *self.gateway.write().await = GatewayInfo::default();
        }
        let _ = self.events.send(EngineEvent::StateChanged(next));
    }

    /// Record a failure: retain it, notify observers, land in Error.
    async fn fail(&self, err: VpnError) {
        warn!("Backend session failed: {}", err);
        *self.last_error.write().await = Some(err.clone());
        let _ = self.events.send(EngineEvent::ProtocolError(err));
        self.set_state(ConnectionState::Error).await;
    }

    /// Record a start-validation failure without moving the state.
    async fn refuse(&self, err: VpnError) -> VpnError {
        warn!("Refusing to start backend session: {}", err);
        *self.last_error.write().await = Some(err.clone());
        let _ = self.events.send(EngineEvent::ProtocolError(err.clone()));
        err
    }

    // ── Prepare ──────────────────────────────────────────────────

    /// Validate the environment: adapters enumerable, driver present
    /// (installed on demand). Returns the adapter names seen. A
    /// pre-flight failure is reported without moving the state machine.
    pub async fn prepare(&self) -> Result<Vec<String>, VpnError> {
        let adapters = match self.client.list_virtual_adapters().await {
            Ok(a) => a,
            Err(e) => return Err(self.refuse(e).await),
        };
        if let Err(e) = self.client.ensure_driver_installed().await {
            let e = if e.code == ErrorCode::ServiceUnreachable {
                e
            } else {
                VpnError::new(ErrorCode::DriverInstallFailed, "Tunnel driver unavailable")
                    .with_detail(e.to_string())
            };
            return Err(self.refuse(e).await);
        }
        info!("Environment prepared, {} virtual adapter(s)", adapters.len());
        Ok(adapters)
    }

    // ── Start ────────────────────────────────────────────────────

    /// Spawn a backend session. Validation failures return (and emit)
    /// a typed error without any state transition; once the backend is
    /// spawned the engine moves to Connecting and the timeout window
    /// opens.
    pub async fn start(&self, config: &SessionConfig) -> Result<(), VpnError> {
        if self.session.lock().await.is_some() {
            self.stop().await;
        }

        // A new session wipes what the previous one left behind.
        *self.last_error.write().await = None;
        *self.gateway.write().await = GatewayInfo::default();
        *self.connected_at.write().await = None;
        self.counters.write().await.reset();
        *self.server_addr.write().await = config.server_addr;

        let backend = match self.locate_backend() {
            Ok(p) => p,
            Err(e) => return Err(self.refuse(e).await),
        };

        if config.config_text.trim().is_empty() {
            return Err(self
                .refuse(VpnError::new(
                    ErrorCode::BackendConfigMissing,
                    "Backend configuration is empty",
                ))
                .await);
        }
        let (config_path, log_path) = match self.write_config_file(&config.config_text).await
        {
            Ok(paths) => paths,
            Err(e) => return Err(self.refuse(e).await),
        };

        let channel = match ManagementChannel::open().await {
            Ok(c) => c,
            Err(e) => {
                let _ = tokio::fs::remove_file(&config_path).await;
                return Err(self.refuse(e).await);
            }
        };

        let mut process = match self.client.create_elevated_process().await {
            Ok(p) => p,
            Err(e) => {
                let _ = tokio::fs::remove_file(&config_path).await;
                return Err(self.refuse(e).await);
            }
        };
        process.set_program(backend.to_string_lossy().into_owned());
        process.set_args(build_backend_args(
            &config_path,
            channel.local_addr(),
            &log_path,
        ));

        // Validation is done; from here the attempt is underway and
        // failures move the state machine.
        self.set_state(ConnectionState::Preparing).await;
        match process.start().await {
            Ok(pid) => info!("Backend spawned, pid {}", pid),
            Err(e) => {
                let _ = tokio::fs::remove_file(&config_path).await;
                self.fail(e.clone()).await;
                return Err(e);
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.stopping.store(false, Ordering::SeqCst);
        *self.session.lock().await = Some(Session {
            process,
            config_path,
        });

        self.set_state(ConnectionState::Connecting).await;
        self.spawn_timeout_supervisor(generation).await;
        self.spawn_channel_loop(channel, generation);
        Ok(())
    }

    fn locate_backend(&self) -> Result<PathBuf, VpnError> {
        match &self.settings.backend_path {
            Some(p) if p.exists() => Ok(p.clone()),
            Some(p) => Err(VpnError::new(
                ErrorCode::BackendExecutableMissing,
                format!("Backend binary not found at {}", p.display()),
            )),
            None => find_backend_binary().ok_or_else(|| {
                VpnError::new(
                    ErrorCode::BackendExecutableMissing,
                    "Backend binary not found in any well-known location",
                )
            }),
        }
    }

    /// Write the config under the work dir with a unique name; the log
    /// file sits next to it.
    async fn write_config_file(&self, text: &str) -> Result<(PathBuf, PathBuf), VpnError> {
        let base = match &self.settings.work_dir {
            Some(dir) => dir.clone(),
            None => dirs::config_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("corridor"),
        };
        let write = async {
            tokio::fs::create_dir_all(&base).await?;
            let id = uuid::Uuid::new_v4();
            let config_path = base.join(format!("{}.conf", id));
            tokio::fs::write(&config_path, text).await?;
            let log_path = base.join(format!("{}.log", id));
            std::io::Result::Ok((config_path, log_path))
        };
        write.await.map_err(|e| {
            VpnError::new(
                ErrorCode::BackendConfigMissing,
                format!("Cannot write backend config under {}", base.display()),
            )
            .with_detail(e.to_string())
        })
    }

    // ── Timeout supervisor ───────────────────────────────────────

    /// One timer per connection attempt. Cancelled exactly once when
    /// the tunnel comes up; a cancelled timer never fires.
    async fn spawn_timeout_supervisor(&self, generation: u64) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        *self.timeout_cancel.lock().await = Some(cancel_tx);

        let Some(engine) = self.me.upgrade() else {
            return;
        };
        let window = self.settings.connect_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel_rx => return,
                _ = tokio::time::sleep(window) => {}
            }
            if engine.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let state = engine.state().await;
            if !matches!(
                state,
                ConnectionState::Preparing | ConnectionState::Connecting
            ) {
                return;
            }
            warn!("Connect window of {:?} expired in {}", window, state);
            let _ = engine.events.send(EngineEvent::TimeoutExpired);
            engine.teardown_session().await;
            engine
                .fail(VpnError::new(
                    ErrorCode::Timeout,
                    format!("Tunnel did not come up within {:?}", window),
                ))
                .await;
        });
    }

    async fn cancel_timeout(&self) {
        if let Some(tx) = self.timeout_cancel.lock().await.take() {
            let _ = tx.send(());
        }
    }

    // ── Channel loop ─────────────────────────────────────────────

    fn spawn_channel_loop(&self, channel: ManagementChannel, generation: u64) {
        let Some(engine) = self.me.upgrade() else {
            return;
        };
        // The backend needs a moment to dial back after the spawn; give
        // the accept more room than the connect window so the timeout
        // supervisor owns the no-show verdict.
        let accept_window = self.settings.connect_timeout + Duration::from_secs(2);
        tokio::spawn(async move {
            let (sink, mut events) = match channel.accept(accept_window).await {
                Ok(pair) => pair,
                Err(e) => {
                    if engine.generation.load(Ordering::SeqCst) == generation
                        && engine.state().await == ConnectionState::Connecting
                        && !engine.stopping.load(Ordering::SeqCst)
                    {
                        engine.teardown_session().await;
                        engine.fail(e).await;
                    }
                    return;
                }
            };
            *engine.sink.lock().await = Some(sink);

            while let Some(event) = events.recv().await {
                if engine.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                if !engine.handle_channel_event(event, generation).await {
                    break;
                }
            }
        });
    }

    /// Send a command to the backend if the sink is still in place.
    async fn send_to_backend(&self, cmd: &str) -> Result<(), VpnError> {
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink.send_command(cmd).await,
            None => Ok(()),
        }
    }

    /// React to one channel event. Returns `false` when the loop is done.
    async fn handle_channel_event(&self, event: ChannelEvent, generation: u64) -> bool {
        match event {
            ChannelEvent::Greeting => {
                let handshake = {
                    let mut sink = self.sink.lock().await;
                    match sink.as_mut() {
                        Some(sink) => {
                            sink.initial_handshake(self.settings.bytecount_interval).await
                        }
                        None => Ok(()),
                    }
                };
                if let Err(e) = handshake {
                    self.teardown_session().await;
                    self.fail(e).await;
                    return false;
                }
                true
            }
            ChannelEvent::Established => {
                self.cancel_timeout().await;
                // One-shot refresh so counters show up promptly.
                let _ = self
                    .send_to_backend(&ChannelCommands::bytecount(
                        self.settings.bytecount_interval,
                    ))
                    .await;
                *self.connected_at.write().await = Some(Utc::now());
                self.set_state(ConnectionState::Connected).await;
                self.spawn_gateway_probe(generation);
                true
            }
            ChannelEvent::Exiting => {
                self.set_state(ConnectionState::Disconnecting).await;
                true
            }
            ChannelEvent::Reestablishing => {
                self.set_state(ConnectionState::Reconnecting).await;
                true
            }
            ChannelEvent::RouteGateway(addr) => {
                let snapshot = {
                    let mut gw = self.gateway.write().await;
                    gw.route_gateway = Some(addr);
                    gw.clone()
                };
                let _ = self.events.send(EngineEvent::GatewayUpdated(snapshot));
                true
            }
            ChannelEvent::TunnelAddresses { local, gateway } => {
                let snapshot = {
                    let mut gw = self.gateway.write().await;
                    gw.tunnel_local = Some(local);
                    gw.tunnel_gateway = Some(gateway);
                    gw.clone()
                };
                let _ = self.events.send(EngineEvent::GatewayUpdated(snapshot));
                true
            }
            ChannelEvent::ByteCount { received, sent } => {
                self.counters.write().await.update(received, sent);
                let _ = self
                    .events
                    .send(EngineEvent::BytesChanged { received, sent });
                true
            }
            ChannelEvent::Fatal { code, message } => {
                self.teardown_session().await;
                self.fail(VpnError::new(code, message)).await;
                false
            }
            ChannelEvent::Eof => {
                if self.stopping.load(Ordering::SeqCst) {
                    return false;
                }
                let state = self.state().await;
                match state {
                    ConnectionState::Connecting => {
                        self.teardown_session().await;
                        self.fail(VpnError::new(
                            ErrorCode::UnknownBackendFault,
                            "Backend closed the management channel during connect",
                        ))
                        .await;
                    }
                    s if s.is_active() || s == ConnectionState::Disconnecting => {
                        self.teardown_session().await;
                        self.set_state(ConnectionState::Disconnected).await;
                    }
                    _ => {}
                }
                false
            }
        }
    }

    /// The backend settles routes a little after CONNECTED; re-derive
    /// the physical adapter once the dust settles.
    fn spawn_gateway_probe(&self, generation: u64) {
        let Some(delay) = self.settings.gateway_probe_delay else {
            return;
        };
        let Some(engine) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if engine.generation.load(Ordering::SeqCst) != generation
                || engine.state().await != ConnectionState::Connected
            {
                return;
            }
            let Some(server) = *engine.server_addr.read().await else {
                return;
            };
            match engine.resolver.resolve(server).await {
                Ok(adapter) => {
                    let snapshot = {
                        let mut gw = engine.gateway.write().await;
                        gw.adapter_name = Some(adapter.name);
                        gw.adapter_index = Some(adapter.index);
                        gw.clone()
                    };
                    let _ = engine.events.send(EngineEvent::GatewayUpdated(snapshot));
                }
                Err(e) => debug!("Gateway probe failed: {}", e),
            }
        });
    }

    // ── Stop ─────────────────────────────────────────────────────

    /// Graceful teardown: SIGTERM over the channel, bounded wait, then
    /// force kill. Gated on active states, idempotent, never errors.
    pub async fn stop(&self) {
        if !self.state().await.is_active() {
            return;
        }
        self.stopping.store(true, Ordering::SeqCst);
        self.cancel_timeout().await;
        self.set_state(ConnectionState::Disconnecting).await;

        if let Err(e) = self.send_to_backend(ChannelCommands::SIGNAL_SIGTERM).await {
            debug!("SIGTERM over management channel failed: {}", e);
        }

        let deadline = tokio::time::Instant::now() + self.settings.stop_grace;
        let exited = loop {
            {
                let session = self.session.lock().await;
                match session.as_ref() {
                    None => break true,
                    Some(s) => match s.process.poll_exited().await {
                        Ok(Some(_)) | Err(_) => break true,
                        Ok(None) => {}
                    },
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        };
        if !exited {
            warn!("Backend ignored SIGTERM, force killing");
            if let Some(s) = self.session.lock().await.as_ref() {
                if let Err(e) = s.process.terminate(true).await {
                    warn!("Force kill failed: {}", e);
                }
            }
        }

        self.teardown_session().await;
        self.set_state(ConnectionState::Disconnected).await;
        self.stopping.store(false, Ordering::SeqCst);
    }

    /// Release process, channel, and scratch files as one unit.
    async fn teardown_session(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_timeout().await;
        self.sink.lock().await.take();
        if let Some(session) = self.session.lock().await.take() {
            if let Err(e) = session.process.terminate(true).await {
                debug!("Terminate on teardown failed: {}", e);
            }
            let _ = tokio::fs::remove_file(&session.config_path).await;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Backend invocation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Arguments for a client-mode backend: our config, our listener, a
/// dedicated log file.
pub fn build_backend_args(config_path: &Path, mgmt: SocketAddr, log_path: &Path) -> Vec<String> {
    vec![
        "--config".into(),
        config_path.to_string_lossy().into_owned(),
        "--management".into(),
        mgmt.ip().to_string(),
        mgmt.port().to_string(),
        "--management-client".into(),
        "--log".into(),
        log_path.to_string_lossy().into_owned(),
    ]
}
