//! Shared primitives for tandem room sync: the `{type, data}` wire protocol,
//! the reaction pipeline that turns an inbound `sync` into checkout + build,
//! and the collaborator traits the pipeline drives. Transport and concrete
//! collaborators live in `tandem-client`; the relay lives in `tandem-server`.

pub mod checkout;
pub mod collab;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod protocol;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use checkout::{checkout_branch, CheckoutOutcome};
pub use collab::{BuildTool, Notifier, Repository, TokenProvider, TracingNotifier, VersionControl};
pub use config::{ConfigPatch, ConfigStore, InMemoryConfigStore, ServerSettings, SessionConfig};
pub use dispatcher::{Dispatcher, Reaction, SyncOutcome};
pub use error::{SyncError, SyncResult};
pub use protocol::{decode, encode, Envelope, ErrorPayload, Message, MessageKind, SyncRecord};
