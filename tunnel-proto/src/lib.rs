//! Shared wire protocol for the tunnel client and server: the framed
//! message codec, the message catalogue, and the logged-connection
//! wrapper both sides build their streams on top of.

pub mod codec;
pub mod conn;
pub mod ident;
pub mod join;
pub mod message;

pub use codec::{read_message, write_message, CodecError, MAX_FRAME_LEN};
pub use conn::LoggedConn;
pub use join::join;
pub use message::{Envelope, Message};
