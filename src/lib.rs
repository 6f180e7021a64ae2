pub mod aggregator;
pub mod attachments;
pub mod client;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod markup;
pub mod message_log;
pub mod models;
pub mod reader;
pub mod server;
pub mod session;
pub mod storage;

pub use error::{ChatError, ChatResult};
