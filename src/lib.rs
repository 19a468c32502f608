//! Tessera core library: region containers and write-ahead logging on the
//! storage-server side, catalog scanning and region assignment on the
//! master side.

#[macro_use]
pub mod utils;

pub mod keys;
pub mod descriptors;
pub mod msgs;

pub mod server;
pub mod master;
pub mod cluster;

pub use utils::print::{logger_init, ME};
pub use utils::{LeaseManager, TesseraError};
