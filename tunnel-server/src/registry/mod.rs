pub mod control_registry;
pub mod tunnel_registry;

pub use control_registry::ControlRegistry;
pub use tunnel_registry::TunnelRegistry;
