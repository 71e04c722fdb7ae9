pub mod actuator;
pub mod config;
pub mod controller;
pub mod error;
pub mod filter_adapter;
pub mod health;
pub mod policy;
pub mod proxy;
pub mod queue;
pub mod source;
pub mod state;

pub use controller::{Controller, ControllerConfig};
pub use error::ControllerError;

/// Maximum number of sources a table may hold. Nothing below the Selection
/// Actuator or the proxy assumes a specific count below this; it is a
/// generous upper bound rather than a hard design limit.
pub const MSW_MAX_SOURCES: usize = 3;

/// Default capacity of the Command Queue (rounded up to a power of two
/// internally — see [`queue::CommandQueue`]).
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default base UDP port for per-source receive sockets (`base_port + i`).
pub const DEFAULT_BASE_PORT: u16 = 12350;

/// Default UDP port for the fan-out send socket.
pub const DEFAULT_OUTPUT_PORT: u16 = 12400;

/// Default HTTP control surface listen address.
pub const DEFAULT_HTTP_LISTEN: &str = "127.0.0.1:8099";

/// Default file-poll command path.
pub const DEFAULT_CMD_FILE: &str = "/tmp/mswitch_cmd";

/// Startup grace period before the health monitor will emit any unhealthy
/// verdict.
pub const STARTUP_GRACE_MS: u64 = 30_000;

/// Default hysteresis window before a recovered source becomes eligible as
/// a failover target again.
pub const DEFAULT_RECOVERY_DELAY_MS: u64 = 5_000;

/// Tracing target used by every log line emitted from this crate.
pub const LOG_TARGET: &str = "mswitch";
