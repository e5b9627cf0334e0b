mod client;
mod config;
mod device_repository;
mod device_state_repository;

pub use client::*;
pub use config::*;
pub use device_repository::*;
pub use device_state_repository::*;
