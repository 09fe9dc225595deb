//! Identity and settings persistence.
//!
//! Three documents live in the datastore: the block identity document
//! (sid/nid pairs for one controller), the service settings document, and the
//! globally shared settings (units, time zone). The stores here cache them
//! in memory, coalesce writes, and surface change notifications.

mod block_store;
mod datastore;
mod settings_store;
mod twinkey;

pub use block_store::{BlockStore, FLUSH_DELAY, READY_TIMEOUT, SHUTDOWN_WRITE_TIMEOUT};
pub use datastore::{
    Datastore, DatastoreEvent, DatastoreValue, HttpDatastore, MemDatastore, FETCH_TIMEOUT,
};
pub use settings_store::{ServiceSettings, SettingsStore, TimeZoneSettings, UnitSettings};
pub use twinkey::{TwinKeyDict, TwinKeyEntry, TwinKeyError};
