//! A minimal asynchronous Redis client.
//!
//! * `frame`: the reply values a server can send back.
//! * `codec`: the incremental reply decoder and the inline command encoder.
//! * `command`: building command lines from a name and arguments.
//! * `connection`: one socket, the commands waiting to be written and the replies waiting to be
//!   matched back to their commands.

pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod frame;

pub use command::{Command, CommandName};
pub use config::Config;
pub use connection::{Connection, ConnectionState, Event};
pub use frame::Frame;

pub const DEFAULT_PORT: u16 = 6379;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
