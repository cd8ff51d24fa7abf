//! Wire protocol spoken between callers, proxies and backends.

pub mod frame;
pub mod metadata;
pub mod status;
pub mod tag;

pub use frame::{CallHeaders, Frame, FrameKind, ProtocolError, MAX_FRAME_SIZE, MAX_HEADERS_SIZE, MAX_MESSAGE_SIZE};
pub use metadata::Metadata;
pub use status::{Code, Status};
pub use tag::{PeerTag, TagError};
