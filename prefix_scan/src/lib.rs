pub mod config;
pub mod device;
mod error;
pub mod io;
pub mod launch;
pub mod scan;

pub use config::ScanConfig;
pub use device::Device;
pub use error::ScanError;
pub use scan::{inclusive_scan, sequential_scan, Scanner};
