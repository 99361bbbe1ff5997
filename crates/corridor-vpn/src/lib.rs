//! # corridor-vpn
//!
//! VPN client connection engine: supervises an OpenVPN-style backend
//! process through a privileged helper service and drives the connection
//! state machine from the backend's management channel.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **types** | Shared enums, structs, errors, event payloads, settings |
//! | **management** | Management channel – local listener, line protocol, commands |
//! | **ipc** | Privileged service client – JSON-line RPC, elevated processes |
//! | **adapter** | Gateway/adapter resolution from the OS route table |
//! | **splittunnel** | Split-tunnel rule state machine and driver seam |
//! | **engine** | Backend engine – session lifecycle, state machine, timeouts |
//! | **daemon** | Platform daemon – activation, deactivation, failure handling |

pub mod vpn;
