pub mod bus;
pub mod error;

pub use bus::{MessageBus, MessageBusConfig, NewMessage, NewSubscription};
pub use error::MessageError;
