pub mod common;
pub mod config;
pub mod socket;
pub mod auth;
pub mod watch;
pub mod connection;
pub mod transport;

pub use common::{Error, Result};
pub use watch::{Watch, Interest};
pub use connection::{Connection, Loader, OutboundMessage};
pub use transport::{
    connect, from_accepted_tcp, from_accepted_unix, parse_address, Address, IterationFlags,
    StreamTransport, TransportOps,
};
