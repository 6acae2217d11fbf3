// Wire model and group identity codec shared by the signald bridge crates.

pub mod constants;
pub mod error;
pub mod group;
pub mod protocol;
pub mod types;

pub use error::{GroupIdError, ProtocolError};
pub use group::{decode_group_id, encode_group_id, is_group_id, DaemonGroup, GroupEntry};
pub use protocol::{Address, Command, DaemonFrame, Quote, Request, RequestAttachment};
pub use types::{InternalGroupId, RequestId};
