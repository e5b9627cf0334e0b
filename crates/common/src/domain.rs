mod command;
mod device;
mod device_state;
mod pending_command;
mod result;

pub use command::*;
pub use device::*;
pub use device_state::*;
pub use pending_command::*;
pub use result::*;
