//! Privileged service client.
//!
//! The engine never spawns the backend or touches drivers itself; those
//! operations cross a privilege boundary to a helper service listening
//! on loopback. The wire protocol is one JSON object per line, one
//! request/reply exchange per connection, with an explicit deadline on
//! every call. A missing or silent service is always surfaced as
//! `ServiceUnreachable`, distinct from backend faults.

use crate::vpn::types::*;
use log::debug;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Wire protocol
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Request sent to the privileged service, one JSON line each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServiceRequest {
    Ping,
    ListVirtualAdapters,
    CheckDriver,
    InstallDriver,
    SpawnProcess {
        program: String,
        args: Vec<String>,
    },
    ProcessStatus {
        pid: u32,
    },
    KillProcess {
        pid: u32,
        force: bool,
    },
    ApplySplitTunnel {
        inet_adapter_index: u32,
        vpn_adapter_index: u32,
        excluded_apps: Vec<String>,
        excluded_ips: Vec<String>,
    },
    ClearSplitTunnel,
}

/// Reply from the privileged service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ServiceResponse {
    Ok,
    Adapters { names: Vec<String> },
    Flag { value: bool },
    Spawned { pid: u32 },
    Status { running: bool, exit_code: Option<i32> },
    Failed { code: ErrorCode, message: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Client side of the privilege boundary.
#[derive(Debug, Clone)]
pub struct PrivilegedServiceClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl PrivilegedServiceClient {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    /// One request/reply exchange on a fresh connection.
    async fn exchange(&self, req: &ServiceRequest) -> io::Result<ServiceResponse> {
        let mut stream = TcpStream::connect(self.addr).await?;
        let mut payload = serde_json::to_vec(req)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        payload.push(b'\n');
        stream.write_all(&payload).await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "service closed the connection",
            ));
        }
        serde_json::from_str(&line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn call(&self, req: &ServiceRequest) -> Result<ServiceResponse, VpnError> {
        match tokio::time::timeout(self.timeout, self.exchange(req)).await {
            Ok(Ok(ServiceResponse::Failed { code, message })) => {
                Err(VpnError::new(code, message))
            }
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(VpnError::new(
                ErrorCode::ServiceUnreachable,
                format!("Privileged service request failed at {}", self.addr),
            )
            .with_detail(e.to_string())),
            Err(_) => Err(VpnError::new(
                ErrorCode::ServiceUnreachable,
                format!(
                    "Privileged service did not answer within {:?}",
                    self.timeout
                ),
            )),
        }
    }

    fn unexpected(resp: ServiceResponse) -> VpnError {
        VpnError::new(
            ErrorCode::ServiceUnreachable,
            "Unexpected reply from privileged service",
        )
        .with_detail(format!("{:?}", resp))
    }

    /// Readiness probe.
    pub async fn ping(&self) -> Result<(), VpnError> {
        match self.call(&ServiceRequest::Ping).await? {
            ServiceResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Names of the virtual adapters the service can see.
    pub async fn list_virtual_adapters(&self) -> Result<Vec<String>, VpnError> {
        match self.call(&ServiceRequest::ListVirtualAdapters).await? {
            ServiceResponse::Adapters { names } => Ok(names),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Whether the tunnel driver is present. Never installs.
    pub async fn driver_installed(&self) -> Result<bool, VpnError> {
        match self.call(&ServiceRequest::CheckDriver).await? {
            ServiceResponse::Flag { value } => Ok(value),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Check the tunnel driver, installing it if absent. Idempotent.
    /// Returns whether an install was performed.
    pub async fn ensure_driver_installed(&self) -> Result<bool, VpnError> {
        if self.driver_installed().await? {
            return Ok(false);
        }
        debug!("Tunnel driver missing, requesting install");
        match self.call(&ServiceRequest::InstallDriver).await? {
            ServiceResponse::Ok => Ok(true),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Obtain a process factory behind the privilege boundary. The
    /// service must be reachable; absence is its own failure class.
    pub async fn create_elevated_process(&self) -> Result<ElevatedProcess, VpnError> {
        self.ping().await?;
        Ok(ElevatedProcess {
            client: self.clone(),
            program: String::new(),
            args: Vec::new(),
            pid: None,
        })
    }

    /// Push a split-tunnel rule set to the service, bound to the
    /// internet-facing and tunnel adapters.
    pub async fn apply_split_tunnel(
        &self,
        inet_adapter_index: u32,
        vpn_adapter_index: u32,
        excluded_apps: &[String],
        excluded_ips: &[String],
    ) -> Result<(), VpnError> {
        let req = ServiceRequest::ApplySplitTunnel {
            inet_adapter_index,
            vpn_adapter_index,
            excluded_apps: excluded_apps.to_vec(),
            excluded_ips: excluded_ips.to_vec(),
        };
        match self.call(&req).await? {
            ServiceResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Drop all split-tunnel rules.
    pub async fn clear_split_tunnel(&self) -> Result<(), VpnError> {
        match self.call(&ServiceRequest::ClearSplitTunnel).await? {
            ServiceResponse::Ok => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Elevated process handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Remote process handle. Program and arguments are staged locally;
/// `start` performs the spawn across the boundary.
#[derive(Debug, Clone)]
pub struct ElevatedProcess {
    client: PrivilegedServiceClient,
    program: String,
    args: Vec<String>,
    pid: Option<u32>,
}

impl ElevatedProcess {
    pub fn set_program(&mut self, program: impl Into<String>) {
        self.program = program.into();
    }

    pub fn set_args(&mut self, args: Vec<String>) {
        self.args = args;
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Spawn the staged program. Returns the remote pid.
    pub async fn start(&mut self) -> Result<u32, VpnError> {
        if self.program.is_empty() {
            return Err(VpnError::new(
                ErrorCode::BackendExecutableMissing,
                "No program staged for the elevated process",
            ));
        }
        let req = ServiceRequest::SpawnProcess {
            program: self.program.clone(),
            args: self.args.clone(),
        };
        match self.client.call(&req).await? {
            ServiceResponse::Spawned { pid } => {
                self.pid = Some(pid);
                Ok(pid)
            }
            other => Err(PrivilegedServiceClient::unexpected(other)),
        }
    }

    /// `Ok(None)` while the process is still running, `Ok(Some(code))`
    /// once it has exited. A never-started handle counts as exited.
    pub async fn poll_exited(&self) -> Result<Option<i32>, VpnError> {
        let Some(pid) = self.pid else {
            return Ok(Some(0));
        };
        match self.client.call(&ServiceRequest::ProcessStatus { pid }).await? {
            ServiceResponse::Status { running: true, .. } => Ok(None),
            ServiceResponse::Status {
                running: false,
                exit_code,
            } => Ok(Some(exit_code.unwrap_or(0))),
            other => Err(PrivilegedServiceClient::unexpected(other)),
        }
    }

    /// Terminate the remote process. No-op when never started.
    pub async fn terminate(&self, force: bool) -> Result<(), VpnError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match self.client.call(&ServiceRequest::KillProcess { pid, force }).await? {
            ServiceResponse::Ok => Ok(()),
            other => Err(PrivilegedServiceClient::unexpected(other)),
        }
    }
}
