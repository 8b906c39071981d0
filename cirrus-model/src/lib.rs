//! Client-side model and polling core of the cirrus compute console.
//!
//! Everything here is single-threaded: entities, collections and pollers use
//! `Rc`/`RefCell` and the async parts run as local tasks inside a
//! `tokio::task::LocalSet`.

pub mod admin;
pub mod collection;
pub mod config;
pub mod context;
pub mod entity;
pub mod envelope;
pub mod error;
pub mod ledger;
pub mod models;
pub mod notice;
pub mod poller;
pub mod prefs;
pub mod resolve;
pub mod schema;
pub mod transport;
pub mod vm;

#[cfg(test)]
mod testing;

pub use admin::{AdminClient, BulkOutcome, BulkRequest};
pub use collection::{Collection, CollectionEvent, FetchOptions, FetchOutcome, FetchSummary};
pub use config::{ModelConfig, PollConfig};
pub use context::Context;
pub use entity::{Entity, EntityEvent, EntityRef};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use ledger::{Ledger, PendingEntry};
pub use notice::{Notice, NoticeKind};
pub use poller::{Poller, PollerState, Tick};
pub use prefs::{MachineView, Pane, ViewPrefs};
pub use resolve::Resolver;
pub use schema::{Attributes, Kind, Schema};
pub use transport::{HttpTransport, Method, Transport};
pub use vm::Action;
