//! Telephony gateway: accepts Twilio media-stream WebSockets and runs one
//! voice pipeline per call.
//!
//! The server answers Twilio's webhook with TwiML pointing the call at `/ws`,
//! decodes the stream's JSON envelopes into pipeline transport events, and
//! encodes synthesized audio back onto the socket.

pub mod connection;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod serializer;
pub mod server;
pub mod state;

pub use serializer::{InboundEvent, SerializerError, TwilioSerializer};
pub use server::{router, serve, start_gateway};
pub use state::{GatewayState, SessionHandle};
