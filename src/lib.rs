//! unrealsync: continuous one-way mirroring of a local directory tree to
//! remote hosts over ssh.
//!
//! The client watches the source tree, rescans changed directories against
//! an in-memory snapshot and appends diff records to an on-disk out-log; one
//! reader per peer drains the log at its own pace into the stdin of a remote
//! `unrealsync --server` process, which applies the stream with staged,
//! atomic writes. Files too large for the in-memory diff buffer stream in
//! chunks with their own init/receive/commit/abort records.

pub mod changes;
pub mod client;
pub mod outlog;
pub mod protocol;
pub mod repository;
pub mod server;
pub mod settings;
pub mod stat;
pub mod status;
pub mod watcher;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
