pub mod manager;
pub mod watchdog;

pub use manager::{Lease, LeaseManager};
pub use watchdog::{Reclaimed, Watchdog};
