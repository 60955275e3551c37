// The qconn wire protocol: question/answer bookkeeping, the QSON codec and
// the connection that drives them.

pub mod connection;
pub mod ids;
pub mod message;
pub mod qson;
pub(crate) mod remote;
pub mod tables;

pub use connection::{Connection, ConnectionConfig, ConnectionStats, LostHook};
pub use ids::IdAllocator;
pub use message::{Message, MessageError};
pub use qson::{escape_key, unescape_key, CodecError};
pub use remote::Role;
pub use tables::{RefTable, TableError, WireRef};
