#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

mod common;
mod config;
mod error;

pub mod connection;
pub mod frame;
pub mod managers;
pub mod messages;
pub mod pool;
pub mod query;
pub mod timer;

pub use crate::common::{Id, Node, ID_SIZE};
pub use crate::config::*;
pub use crate::error::{Error, Result};
pub use bytes::Bytes;

pub use connection::{
    CloseReason, Connection, ConnectionContext, ConnectionHandle, Direction, Status,
};
pub use managers::Handlers;
pub use pool::ConnectionPool;
pub use query::{Operation, Query, QueryContext, QueryHandle, QueryRequest};
pub use timer::{TimerService, TimerWheel};
