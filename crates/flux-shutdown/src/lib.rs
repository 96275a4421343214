pub mod latch;
pub mod signal;

pub use latch::ShutdownLatch;
pub use signal::{ShutdownSignal, SignalHandler};
