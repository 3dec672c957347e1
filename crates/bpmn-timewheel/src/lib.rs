pub mod error;
pub mod iso8601;
pub mod wheel;

pub use error::TimerError;
pub use wheel::{NewTimer, TimeWheel, TimeWheelConfig};
