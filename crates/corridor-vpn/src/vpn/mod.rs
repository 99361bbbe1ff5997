//! Engine module root – re-exports public API surface.

pub mod types;
pub mod management;
pub mod ipc;
pub mod adapter;
pub mod splittunnel;
pub mod engine;
pub mod daemon;

pub use types::*;
pub use engine::{build_engine, OpenVpnEngine};
pub use daemon::{ActivationConfig, KillSwitch, Op, PlatformDaemon};
pub use splittunnel::{SplitTunnelDriver, SplitTunnelManager, SplitTunnelRuleSet};
