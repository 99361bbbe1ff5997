//! End-to-end engine flows against a fake privileged service and a
//! scripted backend speaking the management line protocol.

use corridor_vpn::vpn::ipc::{ServiceRequest, ServiceResponse};
use corridor_vpn::vpn::types::*;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Fake privileged service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Copy, PartialEq)]
enum BackendScript {
    /// Connect, handshake, CONNECTED, gateway lines, byte counts.
    HappyPath,
    /// Connect, handshake, then report the adapters as claimed.
    FatalAdapter,
    /// Never dial the management listener.
    NoShow,
}

#[derive(Clone)]
struct FakeService {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    /// Commands the backend received over the management channel.
    commands: Arc<Mutex<Vec<String>>>,
}

impl FakeService {
    async fn spawn(script: BackendScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = Arc::new(AtomicBool::new(false));
        let commands = Arc::new(Mutex::new(Vec::new()));

        let svc = Self {
            addr,
            running: Arc::clone(&running),
            commands: Arc::clone(&commands),
        };
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    continue;
                }
                let req: ServiceRequest = serde_json::from_str(&line).unwrap();
                let resp = match req {
                    ServiceRequest::Ping => ServiceResponse::Ok,
                    ServiceRequest::ListVirtualAdapters => ServiceResponse::Adapters {
                        names: vec!["TAP-Adapter".into()],
                    },
                    ServiceRequest::CheckDriver => ServiceResponse::Flag { value: true },
                    ServiceRequest::InstallDriver => ServiceResponse::Ok,
                    ServiceRequest::SpawnProcess { args, .. } => {
                        let mgmt = management_addr(&args);
                        running.store(true, Ordering::SeqCst);
                        if script != BackendScript::NoShow {
                            tokio::spawn(run_backend(
                                mgmt,
                                script,
                                Arc::clone(&running),
                                Arc::clone(&commands),
                            ));
                        }
                        ServiceResponse::Spawned { pid: 4242 }
                    }
                    ServiceRequest::ProcessStatus { .. } => {
                        let alive = running.load(Ordering::SeqCst);
                        ServiceResponse::Status {
                            running: alive,
                            exit_code: if alive { None } else { Some(0) },
                        }
                    }
                    ServiceRequest::KillProcess { .. } => {
                        running.store(false, Ordering::SeqCst);
                        ServiceResponse::Ok
                    }
                    ServiceRequest::ApplySplitTunnel { .. }
                    | ServiceRequest::ClearSplitTunnel => ServiceResponse::Ok,
                };
                let mut out = serde_json::to_vec(&resp).unwrap();
                out.push(b'\n');
                let mut stream = reader.into_inner();
                let _ = stream.write_all(&out).await;
            }
        });
        svc
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn backend_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn management_addr(args: &[String]) -> SocketAddr {
    let i = args
        .iter()
        .position(|a| a == "--management")
        .expect("spawn args carry --management");
    format!("{}:{}", args[i + 1], args[i + 2]).parse().unwrap()
}

/// Scripted backend: dials the engine's listener and plays one scenario.
async fn run_backend(
    addr: SocketAddr,
    script: BackendScript,
    running: Arc<AtomicBool>,
    commands: Arc<Mutex<Vec<String>>>,
) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write
        .write_all(b">INFO:OpenVPN Management Interface Version 5 -- type 'help' for more info\r\n")
        .await
        .unwrap();

    // The engine answers the greeting with three handshake commands.
    for _ in 0..3 {
        match lines.next_line().await {
            Ok(Some(line)) => commands.lock().unwrap().push(line),
            _ => return,
        }
    }

    if script == BackendScript::FatalAdapter {
        write
            .write_all(
                b">FATAL:All tap-windows6 adapters on this system are currently in use or disabled.\n",
            )
            .await
            .unwrap();
        return;
    }

    write
        .write_all(b">STATE:1700000000,CONNECTED,SUCCESS,10.8.0.6,203.0.113.4,,\n")
        .await
        .unwrap();
    write
        .write_all(b">LOG:1700000000,I,ROUTE_GATEWAY 192.168.1.1/255.255.255.0 IFACE=eth0\n")
        .await
        .unwrap();
    write
        .write_all(
            b">LOG:1700000000,I,PUSH: Received control message: 'PUSH_REPLY,redirect-gateway def1,ifconfig 10.8.0.2 10.8.0.1,peer-id 0'\n",
        )
        .await
        .unwrap();
    write.write_all(b">BYTECOUNT:1000,500\n").await.unwrap();
    write.write_all(b">BYTECOUNT:2000,900\n").await.unwrap();

    while let Ok(Some(line)) = lines.next_line().await {
        let is_sigterm = line == "signal SIGTERM";
        commands.lock().unwrap().push(line);
        if is_sigterm {
            running.store(false, Ordering::SeqCst);
            let _ = write
                .write_all(b">STATE:1700000001,EXITING,SIGTERM,,,,\n")
                .await;
            break;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn settings(work_dir: &Path, service: &FakeService) -> EngineSettings {
    EngineSettings {
        work_dir: Some(work_dir.to_path_buf()),
        service_addr: service.addr,
        service_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(5),
        stop_grace: Duration::from_secs(2),
        gateway_probe_delay: None,
        ..EngineSettings::default()
    }
}

fn fake_backend_binary(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("openvpn");
    std::fs::write(&path, "#!/bin/sh\n").unwrap();
    path
}

fn session() -> SessionConfig {
    SessionConfig {
        server_addr: Some("203.0.113.4".parse().unwrap()),
        config_text: "client\ndev tun\nremote 203.0.113.4 1194\n".into(),
    }
}

/// Receive events until one satisfies the predicate, returning everything
/// seen up to and including it.
async fn drain_until<F>(
    rx: &mut mpsc::UnboundedReceiver<EngineEvent>,
    pred: F,
) -> Vec<EngineEvent>
where
    F: Fn(&EngineEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an engine event")
            .expect("event stream closed early");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn states(events: &[EngineEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::StateChanged(s) => Some(*s),
            _ => None,
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn connect_report_and_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let service = FakeService::spawn(BackendScript::HappyPath).await;
    let mut cfg = settings(dir.path(), &service);
    cfg.backend_path = Some(fake_backend_binary(dir.path()));
    let (engine, mut rx) =
        corridor_vpn::vpn::build_engine(Protocol::OpenVpn, cfg).unwrap();

    let adapters = engine.prepare().await.unwrap();
    assert_eq!(adapters, vec!["TAP-Adapter".to_string()]);
    // Pre-flight checks do not move the state machine.
    assert_eq!(engine.state().await, ConnectionState::Unknown);

    engine.start(&session()).await.unwrap();
    let events = drain_until(&mut rx, |e| {
        matches!(e, EngineEvent::StateChanged(ConnectionState::Connected))
    })
    .await;
    assert_eq!(
        states(&events),
        vec![
            ConnectionState::Preparing,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    assert!(engine.connected_at().await.is_some());

    // Wait for the second cumulative report so counters are settled.
    drain_until(&mut rx, |e| {
        matches!(
            e,
            EngineEvent::BytesChanged {
                received: 2000,
                sent: 900
            }
        )
    })
    .await;
    assert_eq!(
        engine.counters().await,
        ByteCounters {
            received: 2000,
            sent: 900
        }
    );

    let gw = engine.gateway_info().await;
    assert_eq!(gw.route_gateway.as_deref(), Some("192.168.1.1"));
    assert_eq!(gw.tunnel_local.as_deref(), Some("10.8.0.2"));
    assert_eq!(gw.tunnel_gateway.as_deref(), Some("10.8.0.1"));

    engine.stop().await;
    assert_eq!(engine.state().await, ConnectionState::Disconnected);
    assert!(!service.backend_running());

    let commands = service.commands();
    assert_eq!(&commands[..3], &["state on", "log on", "bytecount 1"]);
    assert!(commands.iter().any(|c| c == "signal SIGTERM"));

    // Scratch config file is cleaned up on teardown.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|x| x == "conf").unwrap_or(false))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn fatal_adapter_report_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let service = FakeService::spawn(BackendScript::FatalAdapter).await;
    let mut cfg = settings(dir.path(), &service);
    cfg.backend_path = Some(fake_backend_binary(dir.path()));
    let (engine, mut rx) =
        corridor_vpn::vpn::build_engine(Protocol::OpenVpn, cfg).unwrap();

    engine.start(&session()).await.unwrap();
    let events = drain_until(&mut rx, |e| {
        matches!(e, EngineEvent::StateChanged(ConnectionState::Error))
    })
    .await;

    let error = events
        .iter()
        .find_map(|e| match e {
            EngineEvent::ProtocolError(err) => Some(err.clone()),
            _ => None,
        })
        .expect("a protocol error precedes the Error state");
    assert_eq!(error.code, ErrorCode::AdapterUnavailable);
    assert_eq!(engine.state().await, ConnectionState::Error);
    assert_eq!(
        engine.last_error().await.unwrap().code,
        ErrorCode::AdapterUnavailable
    );
    // The fatal report terminated parsing before any traffic counting.
    assert!(!events
        .iter()
        .any(|e| matches!(e, EngineEvent::BytesChanged { .. })));
    assert!(!service.backend_running());
}

#[tokio::test]
async fn backend_no_show_expires_the_connect_window() {
    let dir = tempfile::tempdir().unwrap();
    let service = FakeService::spawn(BackendScript::NoShow).await;
    let mut cfg = settings(dir.path(), &service);
    cfg.backend_path = Some(fake_backend_binary(dir.path()));
    cfg.connect_timeout = Duration::from_millis(300);
    let (engine, mut rx) =
        corridor_vpn::vpn::build_engine(Protocol::OpenVpn, cfg).unwrap();

    engine.start(&session()).await.unwrap();
    assert_eq!(engine.state().await, ConnectionState::Connecting);

    let events = drain_until(&mut rx, |e| {
        matches!(e, EngineEvent::StateChanged(ConnectionState::Error))
    })
    .await;
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::TimeoutExpired)));
    let error = events
        .iter()
        .find_map(|e| match e {
            EngineEvent::ProtocolError(err) => Some(err.clone()),
            _ => None,
        })
        .expect("timeout surfaces as a protocol error");
    assert_eq!(error.code, ErrorCode::Timeout);
    // The spawned backend was reaped on teardown.
    assert!(!service.backend_running());
}
