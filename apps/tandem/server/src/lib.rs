//! Room relay for tandem. Members connect to `/room/:room_id` with a bearer
//! token; `sync` envelopes are acknowledged to the sender and fanned out to
//! every member of the room.

pub mod config;
pub mod registry;
pub mod relay;
pub mod telemetry;

pub use config::{Cli, RelayConfig};
pub use registry::{RoomConfig, RoomRegistry, RoomSnapshot};
pub use relay::{router, spawn, AppState, RelayHandle};
