pub mod domain;
pub mod mqtt;

mod device_sync;

pub use device_sync::*;
pub use domain::*;
