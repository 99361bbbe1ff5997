//! Platform daemon glue.
//!
//! Sequences split-tunnel activation around tunnel up/down and watches
//! the engine's event stream for backend failures. On a failure the
//! daemon releases everything that could strand the host offline: the
//! split-tunnel driver state and the kill switch. That reaction fires
//! at most once per activation.

use crate::vpn::adapter::GatewayAddressResolver;
use crate::vpn::splittunnel::{SplitTunnelDriver, SplitTunnelManager, SplitTunnelRuleSet};
use crate::vpn::types::*;
use async_trait::async_trait;
use log::{info, warn};
use std::net::IpAddr;
use tokio::sync::mpsc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Seams
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Firewall lockdown owned by the platform layer. The daemon only ever
/// needs to lift it, and only on backend failure.
#[async_trait]
pub trait KillSwitch: Send + Sync {
    async fn disable(&self) -> Result<(), VpnError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Activation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tunnel transition the daemon is asked to sequence around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Up,
    Down,
}

/// Everything needed to bring split tunneling up alongside a session.
#[derive(Debug, Clone)]
pub struct ActivationConfig {
    pub server_addr: IpAddr,
    /// How the internet-facing adapter is found.
    pub inet_adapter: AdapterSelection,
    /// Index of the tunnel adapter the session brought up.
    pub vpn_adapter_index: u32,
    pub rules: SplitTunnelRuleSet,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Daemon
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PlatformDaemon<D: SplitTunnelDriver, K: KillSwitch> {
    resolver: GatewayAddressResolver,
    split_tunnel: SplitTunnelManager<D>,
    kill_switch: K,
    inet_adapter_index: Option<u32>,
    failure_handled: bool,
}

impl<D: SplitTunnelDriver, K: KillSwitch> PlatformDaemon<D, K> {
    pub fn new(driver: D, kill_switch: K) -> Self {
        Self {
            resolver: GatewayAddressResolver::new(),
            split_tunnel: SplitTunnelManager::new(driver),
            kill_switch,
            inet_adapter_index: None,
            failure_handled: false,
        }
    }

    pub fn inet_adapter_index(&self) -> Option<u32> {
        self.inet_adapter_index
    }

    /// Pin down the internet-facing adapter for this activation and
    /// re-arm the failure reaction. An explicit non-zero index skips
    /// route lookup; index zero means "pick for me", same as automatic.
    pub async fn prepare_activation(&mut self, config: &ActivationConfig) -> Result<(), VpnError> {
        let index = match config.inet_adapter {
            AdapterSelection::Explicit(index) if index != 0 => index,
            _ => self.resolver.resolve(config.server_addr).await?.index,
        };
        info!("Split tunnel will ride adapter index {}", index);
        self.inet_adapter_index = Some(index);
        self.failure_handled = false;
        Ok(())
    }

    /// Reconcile split-tunnel state with the requested rule set. Empty
    /// rules mean "off", not "exclude nothing".
    pub async fn activate_split_tunnel(
        &mut self,
        config: &ActivationConfig,
    ) -> Result<(), VpnError> {
        if config.rules.is_empty() {
            self.split_tunnel.stop().await;
            return Ok(());
        }
        let inet = self.inet_adapter_index.ok_or_else(|| {
            VpnError::new(
                ErrorCode::AdapterUnavailable,
                "Split tunnel requested before activation was prepared",
            )
        })?;
        if self.split_tunnel.is_started() {
            self.split_tunnel.set_rules(config.rules.clone()).await
        } else {
            self.split_tunnel
                .start(inet, config.vpn_adapter_index, config.rules.clone())
                .await
        }
    }

    /// Run one tunnel transition. `Down` never fails.
    pub async fn run(&mut self, op: Op, config: &ActivationConfig) -> Result<(), VpnError> {
        match op {
            Op::Up => {
                self.prepare_activation(config).await?;
                if !config.rules.is_empty() && !self.split_tunnel.driver_installed().await? {
                    self.split_tunnel.install_driver().await?;
                }
                self.activate_split_tunnel(config).await
            }
            Op::Down => {
                self.split_tunnel.stop().await;
                self.inet_adapter_index = None;
                Ok(())
            }
        }
    }

    /// Consume engine events until the stream closes, reacting to the
    /// first backend failure.
    pub async fn monitor_backend_failure(&mut self, events: &mut mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::ProtocolError(err) => {
                    warn!("Backend failure observed: {}", err);
                    self.handle_backend_failure().await;
                }
                EngineEvent::TimeoutExpired => {
                    warn!("Backend failure observed: connect timeout");
                    self.handle_backend_failure().await;
                }
                _ => {}
            }
        }
    }

    /// Release split-tunnel and kill-switch state so a dead backend
    /// cannot leave the host without connectivity. Runs at most once
    /// per activation; `prepare_activation` re-arms it.
    pub async fn handle_backend_failure(&mut self) {
        if self.failure_handled {
            return;
        }
        self.failure_handled = true;
        self.split_tunnel.stop().await;
        if let Err(e) = self.kill_switch.disable().await {
            warn!("Kill-switch disable after backend failure: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::splittunnel::test_support::{DriverCall, RecordingDriver};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct CountingKillSwitch {
        disables: Arc<AtomicUsize>,
    }

    impl CountingKillSwitch {
        fn count(&self) -> usize {
            self.disables.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KillSwitch for CountingKillSwitch {
        async fn disable(&self) -> Result<(), VpnError> {
            self.disables.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn activation(apps: &[&str]) -> ActivationConfig {
        ActivationConfig {
            server_addr: "203.0.113.7".parse().unwrap(),
            inet_adapter: AdapterSelection::Explicit(5),
            vpn_adapter_index: 29,
            rules: SplitTunnelRuleSet {
                excluded_apps: apps.iter().map(|s| s.to_string()).collect(),
                excluded_ips: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn up_installs_driver_before_applying_rules() {
        let driver = RecordingDriver::with_driver_installed(false);
        let ks = CountingKillSwitch::default();
        let mut daemon = PlatformDaemon::new(driver.clone(), ks);

        daemon.run(Op::Up, &activation(&["firefox"])).await.unwrap();
        let calls = driver.calls();
        assert_eq!(calls[0], DriverCall::IsInstalled);
        assert_eq!(calls[1], DriverCall::Install);
        assert!(matches!(calls[2], DriverCall::Apply(5, 29, _)));
        assert_eq!(daemon.inet_adapter_index(), Some(5));
    }

    #[tokio::test]
    async fn up_with_installed_driver_skips_install() {
        let driver = RecordingDriver::with_driver_installed(true);
        let mut daemon = PlatformDaemon::new(driver.clone(), CountingKillSwitch::default());

        daemon.run(Op::Up, &activation(&["firefox"])).await.unwrap();
        assert!(!driver.calls().contains(&DriverCall::Install));
    }

    #[tokio::test]
    async fn empty_rules_deactivate_split_tunnel() {
        let driver = RecordingDriver::with_driver_installed(true);
        let mut daemon = PlatformDaemon::new(driver.clone(), CountingKillSwitch::default());

        daemon.run(Op::Up, &activation(&["firefox"])).await.unwrap();
        daemon.run(Op::Up, &activation(&[])).await.unwrap();
        assert_eq!(driver.calls().last(), Some(&DriverCall::Clear));
        // No driver probe for an empty set either.
        assert_eq!(
            driver
                .calls()
                .iter()
                .filter(|c| **c == DriverCall::IsInstalled)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn down_is_idempotent() {
        let driver = RecordingDriver::with_driver_installed(true);
        let mut daemon = PlatformDaemon::new(driver.clone(), CountingKillSwitch::default());

        daemon.run(Op::Up, &activation(&["firefox"])).await.unwrap();
        daemon.run(Op::Down, &activation(&["firefox"])).await.unwrap();
        daemon.run(Op::Down, &activation(&["firefox"])).await.unwrap();
        assert_eq!(daemon.inet_adapter_index(), None);
        assert_eq!(
            driver
                .calls()
                .iter()
                .filter(|c| **c == DriverCall::Clear)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn down_succeeds_even_when_driver_clear_fails() {
        let driver = RecordingDriver::with_failing_clear();
        let mut daemon = PlatformDaemon::new(driver.clone(), CountingKillSwitch::default());

        daemon.run(Op::Up, &activation(&["firefox"])).await.unwrap();
        daemon
            .run(Op::Down, &activation(&["firefox"]))
            .await
            .expect("Down must never fail");
        // Deactivation wound down despite the failed clear.
        assert_eq!(daemon.inet_adapter_index(), None);
        assert!(driver.calls().contains(&DriverCall::Clear));
        // And stays down on a repeat.
        daemon
            .run(Op::Down, &activation(&["firefox"]))
            .await
            .expect("Down must never fail");
    }

    #[tokio::test]
    async fn backend_failure_reacts_exactly_once() {
        let driver = RecordingDriver::with_driver_installed(true);
        let ks = CountingKillSwitch::default();
        let mut daemon = PlatformDaemon::new(driver.clone(), ks.clone());
        daemon.run(Op::Up, &activation(&["firefox"])).await.unwrap();

        daemon.handle_backend_failure().await;
        daemon.handle_backend_failure().await;
        assert_eq!(ks.count(), 1);
        assert_eq!(
            driver
                .calls()
                .iter()
                .filter(|c| **c == DriverCall::Clear)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn failure_reaction_rearms_on_next_activation() {
        let driver = RecordingDriver::with_driver_installed(true);
        let ks = CountingKillSwitch::default();
        let mut daemon = PlatformDaemon::new(driver.clone(), ks.clone());

        daemon.run(Op::Up, &activation(&["firefox"])).await.unwrap();
        daemon.handle_backend_failure().await;
        daemon.run(Op::Up, &activation(&["firefox"])).await.unwrap();
        daemon.handle_backend_failure().await;
        assert_eq!(ks.count(), 2);
    }

    #[tokio::test]
    async fn monitor_reacts_to_error_events() {
        let driver = RecordingDriver::with_driver_installed(true);
        let ks = CountingKillSwitch::default();
        let mut daemon = PlatformDaemon::new(driver.clone(), ks.clone());
        daemon.run(Op::Up, &activation(&["firefox"])).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(EngineEvent::StateChanged(ConnectionState::Connecting))
            .unwrap();
        tx.send(EngineEvent::ProtocolError(VpnError::new(
            ErrorCode::UnknownBackendFault,
            "backend died",
        )))
        .unwrap();
        tx.send(EngineEvent::TimeoutExpired).unwrap();
        drop(tx);

        daemon.monitor_backend_failure(&mut rx).await;
        // Two failure events, one reaction.
        assert_eq!(ks.count(), 1);
    }
}
