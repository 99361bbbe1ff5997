//! Split-tunnel rule state machine.
//!
//! The manager tracks whether split tunneling is active, which adapter
//! pair it is bound to, and which rule set is applied. Rule updates
//! replace the whole set; there is no merging. Actual driver work
//! happens behind the `SplitTunnelDriver` seam, whose production
//! implementation delegates to the privileged service. Driver
//! presence/install are exposed as pass-throughs for the daemon and
//! never invoked by the manager on its own.

use crate::vpn::ipc::PrivilegedServiceClient;
use crate::vpn::types::*;
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Rule set
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Applications and addresses excluded from the tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitTunnelRuleSet {
    pub excluded_apps: Vec<String>,
    pub excluded_ips: Vec<String>,
}

impl SplitTunnelRuleSet {
    pub fn is_empty(&self) -> bool {
        self.excluded_apps.is_empty() && self.excluded_ips.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Driver seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Boundary to the platform's split-tunnel driver. Rules bind to the
/// internet-facing adapter and the tunnel adapter as a pair.
#[async_trait]
pub trait SplitTunnelDriver: Send + Sync {
    async fn is_installed(&self) -> Result<bool, VpnError>;
    async fn install(&self) -> Result<(), VpnError>;
    async fn apply(
        &self,
        inet_adapter_index: u32,
        vpn_adapter_index: u32,
        rules: &SplitTunnelRuleSet,
    ) -> Result<(), VpnError>;
    async fn clear(&self) -> Result<(), VpnError>;
}

/// Production driver: every operation crosses the privilege boundary.
pub struct ServiceTunnelDriver {
    client: PrivilegedServiceClient,
}

impl ServiceTunnelDriver {
    pub fn new(client: PrivilegedServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SplitTunnelDriver for ServiceTunnelDriver {
    async fn is_installed(&self) -> Result<bool, VpnError> {
        self.client.driver_installed().await
    }

    async fn install(&self) -> Result<(), VpnError> {
        self.client.ensure_driver_installed().await.map(|_| ())
    }

    async fn apply(
        &self,
        inet_adapter_index: u32,
        vpn_adapter_index: u32,
        rules: &SplitTunnelRuleSet,
    ) -> Result<(), VpnError> {
        self.client
            .apply_split_tunnel(
                inet_adapter_index,
                vpn_adapter_index,
                &rules.excluded_apps,
                &rules.excluded_ips,
            )
            .await
    }

    async fn clear(&self) -> Result<(), VpnError> {
        self.client.clear_split_tunnel().await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
enum ManagerState {
    Stopped,
    Started {
        inet_adapter_index: u32,
        vpn_adapter_index: u32,
        rules: SplitTunnelRuleSet,
    },
}

/// Tracks split-tunnel activation, the bound adapter pair, and the
/// applied rule set.
pub struct SplitTunnelManager<D: SplitTunnelDriver> {
    driver: D,
    state: ManagerState,
}

impl<D: SplitTunnelDriver> SplitTunnelManager<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            state: ManagerState::Stopped,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self.state, ManagerState::Started { .. })
    }

    /// Rule set currently applied, when started.
    pub fn rules(&self) -> Option<&SplitTunnelRuleSet> {
        match &self.state {
            ManagerState::Started { rules, .. } => Some(rules),
            ManagerState::Stopped => None,
        }
    }

    /// Activate with an initial rule set on the given adapter pair.
    /// Starting again on the same pair is a no-op; rule changes go
    /// through `set_rules`.
    pub async fn start(
        &mut self,
        inet_adapter_index: u32,
        vpn_adapter_index: u32,
        rules: SplitTunnelRuleSet,
    ) -> Result<(), VpnError> {
        if let ManagerState::Started {
            inet_adapter_index: inet,
            vpn_adapter_index: vpn,
            ..
        } = &self.state
        {
            if *inet == inet_adapter_index && *vpn == vpn_adapter_index {
                debug!(
                    "Split tunnel already started on adapters {}/{}",
                    inet_adapter_index, vpn_adapter_index
                );
                return Ok(());
            }
        }
        self.driver
            .apply(inet_adapter_index, vpn_adapter_index, &rules)
            .await?;
        debug!(
            "Split tunnel started on adapters {}/{} ({} apps, {} ips)",
            inet_adapter_index,
            vpn_adapter_index,
            rules.excluded_apps.len(),
            rules.excluded_ips.len()
        );
        self.state = ManagerState::Started {
            inet_adapter_index,
            vpn_adapter_index,
            rules,
        };
        Ok(())
    }

    /// Replace the rule set wholesale. Only meaningful while started;
    /// a stopped manager ignores the update.
    pub async fn set_rules(&mut self, rules: SplitTunnelRuleSet) -> Result<(), VpnError> {
        let (inet, vpn) = match &self.state {
            ManagerState::Started {
                inet_adapter_index,
                vpn_adapter_index,
                ..
            } => (*inet_adapter_index, *vpn_adapter_index),
            ManagerState::Stopped => {
                warn!("Ignoring split-tunnel rule update while stopped");
                return Ok(());
            }
        };
        self.driver.apply(inet, vpn, &rules).await?;
        self.state = ManagerState::Started {
            inet_adapter_index: inet,
            vpn_adapter_index: vpn,
            rules,
        };
        Ok(())
    }

    /// Deactivate. Never fails: a failed driver clear is logged and the
    /// manager still leaves `Started`. Safe to call when already stopped.
    pub async fn stop(&mut self) {
        if matches!(self.state, ManagerState::Stopped) {
            return;
        }
        if let Err(e) = self.driver.clear().await {
            warn!("Split-tunnel driver clear failed: {}", e);
        }
        self.state = ManagerState::Stopped;
        debug!("Split tunnel stopped");
    }

    /// Driver presence check, for the daemon's activation sequence.
    pub async fn driver_installed(&self) -> Result<bool, VpnError> {
        self.driver.is_installed().await
    }

    /// Driver install, for the daemon's activation sequence. Idempotent.
    pub async fn install_driver(&self) -> Result<(), VpnError> {
        self.driver.install().await
    }
}
