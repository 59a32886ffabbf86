//! In-process lifecycle notifications

pub mod audit;
pub mod bus;
pub mod event;

pub use audit::EventLogger;
pub use bus::{EventBus, EventHandler};
pub use event::{Event, EventType};
