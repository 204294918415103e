pub mod binary;
pub mod codec;
pub mod constants;
pub mod frame;

// Re-export primary types for convenience.
pub use binary::{decode_binary, encode_binary};
pub use codec::{DecodeError, decode, encode};
pub use constants::FrameType;
pub use frame::{ErrorReport, FileChunk, Frame, Progress, Success};
