pub mod board;
pub mod codec;
pub mod discovery;
pub mod dispatch;
pub mod document;
pub mod geometry;
pub mod protocol;
pub mod transport;

pub use board::{BoardError, Cluster, JoinOutcome, PuzzleBoard};
pub use codec::{Codec, CodecError, Decoded, JsonLinesCodec, LengthPrefixedCodec, WireFormat};
pub use discovery::{seek, seek_at, Announcement, AnnouncementError, Discovered, DiscoveryResponder};
pub use dispatch::{CallTable, DispatchError, Dispatcher, Handler, Remote};
pub use document::{ClusterRecord, ClusterState, Link, Piece, PuzzleLayout};
pub use geometry::{ClusterId, PieceId, Position, SNAP_DISTANCE};
pub use protocol::{Call, CallSpec, ClientMsg, Direction, Pixmap, PlayerId, ServerMsg, CALLS};
pub use transport::{Inbound, Inbox, SenderId, Transport, TransportError};
