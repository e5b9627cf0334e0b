mod command_dispatcher;
mod command_publisher;
mod command_status_book;
mod command_timers;
mod device_locks;
mod device_registry;
mod feed_notifier;
mod in_memory_device_store;
mod inbound_message;
mod read_side_feed;
mod state_reconciler;
mod sync_config;
mod transport_status;

pub use command_dispatcher::*;
pub use command_publisher::*;
pub use command_status_book::*;
pub use command_timers::*;
pub use device_locks::*;
pub use device_registry::*;
pub use feed_notifier::*;
pub use in_memory_device_store::*;
pub use inbound_message::*;
pub use read_side_feed::*;
pub use state_reconciler::*;
pub use sync_config::*;
pub use transport_status::*;
