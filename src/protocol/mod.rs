//! Wire protocol: request encoding and typed reply decoding
//!
//! Requests always use the unified multi-bulk form. Replies are decoded one
//! flat frame at a time so a multibulk header and its children can be pulled
//! individually from a batch.

pub mod codec;
pub mod reply;

pub use codec::WireCodec;
pub use reply::Reply;
