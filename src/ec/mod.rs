//! Erasure Coding Module
//!
//! Block-level Reed-Solomon coding used by the RAID 6 driver.
//!
//! ```text
//!   object payload
//!   ├── chunk 0 (block_size bytes) ──encode──▶ shard 0 … shard k+m-1
//!   ├── chunk 1                    ──encode──▶ shard 0 … shard k+m-1
//!   └── …
//!        shard b of every chunk lives on drive b
//! ```
//!
//! # Components
//!
//! - **Encoder/Decoder** (`encoder.rs`): k+m encoding of one block, decode
//!   from any k shards, reconstruction of missing shards.
//! - **Shard names** (`shard.rs`): `<object>.<chunk>.<block>[.v<N>]` file
//!   naming and parsing.

pub mod encoder;
pub mod shard;

#[cfg(test)]
mod proptest;

pub use encoder::{EcDecoder, EcEncoder};
pub use shard::{parse_shard_name, shard_file_name, ShardName};
