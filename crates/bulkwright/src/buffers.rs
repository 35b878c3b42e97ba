//! 🧺 Buffers: where bulk bytes live between "collected" and "the cluster said 200".
//!
//! 🧠 Knowledge graph:
//! - `BulkBuffer` is the accumulator. NDJSON bytes plus the ids and failure reasons that ride
//!   along with them, plus a per-operation status map filled in from the bulk response.
//! - `BulkBufferPool` hands out `PooledBulkBuffer` guards. Dropping a guard resets the buffer
//!   and hands it back. No "remember to call return()" homework.
//! - `BytePool` recycles the raw `Vec<u8>` storage by power-of-two size class, so the next
//!   10 MiB batch does not have to ask the allocator nicely all over again.
//!
//! 🦆 The duck is pooled. It has been reset. It remembers nothing.

mod bulk_buffer;
mod pool;

pub use bulk_buffer::BulkBuffer;
pub use pool::{BulkBufferPool, BytePool, PoolConfig, PoolStats, PooledBulkBuffer};
