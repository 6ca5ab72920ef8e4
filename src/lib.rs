//! cloudsync: watch a local directory, reconcile it against a server's copy
//! and stream every change as it happens.

pub mod apply;
pub mod checksum;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod debounce;
pub mod inventory;
pub mod logger;
pub mod operation;
pub mod paths;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod snapshot;
pub mod socket;
pub mod transfer;
pub mod tree;
pub mod watcher;
