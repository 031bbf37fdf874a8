//! Wire format of the murmur chat protocol.
//!
//! Every record on the wire is a fixed 80-byte header followed by a
//! variable-length body. All integers are little-endian:
//!
//! ```text
//! sender[64] : kind(u32) : pad[4] : length(u64) : body[length]
//! ```
//!
//! The 4 pad bytes keep the layout identical to the native struct used by
//! the existing clients; they are written as zero and ignored on parse.
//! This crate is pure byte shuffling: it never touches a socket.

mod file;
mod frame;
mod kind;

pub use file::{FILE_INFO_LEN, FILENAME_LEN, FileInfo};
pub use frame::{
    EncodeError, HEADER_LEN, Header, HeaderStatus, InvalidFrame, SENDER_LEN, control, encode,
    file_data, file_end, file_start, initial, try_parse_header,
};
pub use kind::MsgKind;

/// Server-wide ceiling on a frame body unless overridden by configuration.
/// Large enough for one file chunk, small enough that a hostile peer cannot
/// make the server buffer unbounded data for a single frame.
pub const DEFAULT_MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// Sender field used on frames the server originates itself.
pub const SERVER_SENDER: &str = "SERVER";
