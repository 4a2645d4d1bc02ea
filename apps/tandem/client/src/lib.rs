//! Client side of tandem: the room channel to the relay, the session loop
//! that feeds inbound frames to the dispatcher, the command surface, and the
//! concrete git / shell / token / file-store collaborators.

pub mod auth;
pub mod build_tool;
pub mod channel;
pub mod cli;
pub mod commands;
pub mod git;
pub mod session;
pub mod store;
pub mod telemetry;

pub use auth::{CommandTokenProvider, StaticTokenProvider};
pub use build_tool::ShellBuildTool;
pub use channel::{ChannelEvent, ChannelSettings, ChannelTarget, CloseDisposition, RoomChannel};
pub use commands::CommandSurface;
pub use git::GitCli;
pub use session::{ReactionReport, Session};
pub use store::{FileConfigStore, StoreError};
