pub mod signal;

pub use signal::{SignalCoordinator, SignalState};
