//! The message codec.
//!
//! The resolver core treats DNS wire data through the narrow surface of
//! this module: [`QueryBuilder`] to encode queries and
//! [`Message::from_octets`] to decode responses.

pub use self::iana::{Class, Rcode, Rtype};
pub use self::message::{
    Header, Message, ParseError, Question, QueryBuilder, Record,
};

pub mod iana;
pub mod message;
