//! Wire types shared between the atelier server and its clients.

mod protocol;

pub use protocol::ClientMessage;
pub use protocol::Envelope;
pub use protocol::HealthResponse;
pub use protocol::SessionCreatedResponse;
