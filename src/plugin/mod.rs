//! Plugin system
//!
//! Plugins are separate executables found on disk by their manifest. The
//! kernel starts each one on its own port and forwards the routes it
//! declares, optionally running its declared middleware callouts.
//!
//! # Modules
//!
//! - `manifest`: manifest schema and the discovered plugin definition
//! - `registry`: recursive discovery under the plugin root
//! - `supervisor`: process lifecycle, port assignment and status
//! - `proxy`: request forwarding and plugin route registration
//! - `middleware`: plugin-declared middleware callouts

pub mod manifest;
pub mod middleware;
pub mod proxy;
pub mod registry;
pub mod supervisor;

pub use manifest::{MiddlewareDescriptor, PluginDefinition, PluginManifest, RouteDescriptor};
pub use middleware::{register_plugin_middleware, PluginMiddleware};
pub use proxy::{register_plugin_routes, PluginProxy, UpstreamClient};
pub use registry::{Discovery, PluginRegistry};
pub use supervisor::{PluginEndpoint, ProcessStatus, ProcessSupervisor};
