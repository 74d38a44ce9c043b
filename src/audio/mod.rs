//! Encoder invocation and segment bookkeeping
//!
//! Audio never passes through this process: ffmpeg captures and encodes,
//! writing numbered segment files. `encoder` builds its command line and
//! `chunk` tracks the files it produces.

pub mod chunk;
pub mod encoder;

pub use chunk::{Chunk, ChunkProgress, ChunkTracker, ChunkTrackerConfig};
pub use encoder::{
    chunk_file_name, chunk_prefix, locate_binary, parse_chunk_sequence, Codec, EncoderCommand,
    EncoderParams,
};
