//! The `bridge` module ties configuration, broker connections and sinks
//! together and owns the process lifetime.

pub mod signals;
pub mod supervisor;

pub use signals::wait_for_shutdown_signal;
pub use supervisor::BridgeSupervisor;
