pub mod descriptor;
pub mod loader;
pub mod registry;
pub mod remote;
pub mod unit;

pub use descriptor::PluginDescriptor;
pub use loader::{DiscoveryReport, LoaderSettings, PluginLoader};
pub use registry::PluginRegistry;
pub use unit::{IsolationUnit, UnitLease};
