mod error;
mod stats;
mod tick;

pub use error::ServerError;
pub use stats::{TICK_WINDOW, TickStats};
pub use tick::{DEFAULT_TICK_RATE, Server, ServerState, TickConfig, TickSubsystem};
