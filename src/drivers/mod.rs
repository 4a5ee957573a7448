//! External-system drivers (spec §4.2): everything that shells out, speaks
//! to a Unix socket, or calls a sidecar's admin API lives here. Mirrors the
//! teacher's flat `firecracker.rs`/`network.rs`/`proxy.rs` module layout,
//! split further to match the spec's wider driver surface.

pub mod agent_client;
pub mod jailer;
pub mod network;
pub mod overlay;
pub mod proxy;
pub mod ssh_key;
pub mod vmm;
