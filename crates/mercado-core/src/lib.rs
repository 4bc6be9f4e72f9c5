pub mod clock;
pub mod ids;
pub mod messages;
pub mod normalize;
pub mod protocol;

pub use clock::{Clock, FixedClock, SystemClock};
pub use ids::{ConnectionId, MessageId};
pub use messages::{ChatMessage, IncomingMessage, NewMessage};
pub use normalize::NormalizedMessages;
pub use protocol::{ClientEvent, ErrorKind, ServerEvent};
