//! Background workers.
//!
//! Both workers follow the same shape: a `tokio::time::interval` loop
//! with a `watch`-channel shutdown, doing one bounded pass per tick.

mod power;
mod signals;

pub use power::{PowerMonitor, RefreshStats};
pub use signals::{DrainStats, SignalWorker, SignalWorkerConfig};
