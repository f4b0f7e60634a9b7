pub mod clock;
pub mod destination;
pub mod job;
pub mod logging;
pub mod message;

pub use clock::{Clock, ManualClock, SystemClock};
pub use destination::{Destination, DestinationKind, DestinationParseError};
pub use job::{JobId, JobKind, ScheduledJob};
pub use message::{Message, MessageId, PropertyValue};
pub use tracing;

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
