//! Sample buffers and dataset storage.
pub mod chunk;
pub mod rolling_buffer;
pub mod saver;
