//! 🧭 Shard router: given a document id, which shard will Elasticsearch put it on?
//!
//! 🧠 Knowledge graph: Elasticsearch hashes the routing value with murmur3 (x86, 32-bit,
//! seed 0) over the UTF-16 bytes of the string. We feed it each id byte followed by a zero
//! byte, which is the same thing for ASCII ids and the established quirk for everything else.
//! From 7.x on, the hash is taken modulo `routing_num_shards` (a power-of-two multiple of the
//! shard count, so indices can be split later) and then divided back down.
//!
//! ⚠️ The arithmetic below has to match the cluster bit for bit. If you "simplify" the
//! negative-hash branch, documents will still get routed. Just not where they live. 🦆

use crate::error::BulkError;

const LOG2_MAX_NUM_SHARDS: u32 = 10;

/// 🔢 MurmurHash3, x86 32-bit flavor.
pub fn murmur3_x86_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut hash = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        hash ^= k;
        hash = hash.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    let mut k: u32 = 0;
    if tail.len() >= 3 {
        k ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        k ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        k ^= u32::from(tail[0]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        hash ^= k;
    }

    hash ^= data.len() as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^= hash >> 16;
    hash
}

/// 🧬 The routing hash Elasticsearch computes for `doc_id`, as a signed 32-bit value.
pub fn es_murmur3_hash(doc_id: &[u8]) -> i32 {
    let mut doubled = vec![0u8; doc_id.len() * 2];
    for (i, byte) in doc_id.iter().enumerate() {
        doubled[i * 2] = *byte;
    }
    murmur3_x86_32(&doubled, 0) as i32
}

/// 📐 Default `index.number_of_routing_shards` for a shard count.
///
/// Before 7.x it is just the shard count. From 7.x on it is the shard count shifted left
/// until it approaches 1024, and always by at least one bit.
pub fn routing_num_shards(number_of_shards: i32, es_major_version: u32) -> i32 {
    if es_major_version < 7 {
        return number_of_shards;
    }
    let ceil_log2 = 32 - ((number_of_shards - 1) as u32).leading_zeros();
    let num_splits = LOG2_MAX_NUM_SHARDS.saturating_sub(ceil_log2).max(1);
    number_of_shards << num_splits
}

/// 🎯 Shard for `doc_id`.
///
/// `routing_num_shards <= 0` means "derive it from the version". `partition_offset` of 1
/// means no routing partition.
pub fn shard_id(
    doc_id: &[u8],
    number_of_shards: i32,
    routing_num_shards: i32,
    partition_offset: i32,
    es_major_version: u32,
) -> Result<i32, BulkError> {
    if number_of_shards <= 0 {
        return Err(BulkError::InvalidShardSettings {
            reason: format!("number_of_shards must be positive, got {number_of_shards}"),
        });
    }
    if partition_offset <= 0 {
        return Err(BulkError::InvalidShardSettings {
            reason: format!("partition_offset must be positive, got {partition_offset}"),
        });
    }

    let routing_num_shards = if routing_num_shards <= 0 {
        self::routing_num_shards(number_of_shards, es_major_version)
    } else {
        routing_num_shards
    };
    if routing_num_shards < number_of_shards {
        return Err(BulkError::InvalidShardSettings {
            reason: format!(
                "routing_num_shards ({routing_num_shards}) is smaller than number_of_shards ({number_of_shards})"
            ),
        });
    }

    // -- i64 all the way down: the partition bump and the negative branch can leave i32 range.
    let mut hash = i64::from(es_murmur3_hash(doc_id));
    if partition_offset != 1 {
        hash += hash % i64::from(partition_offset);
    }

    let routing_num_shards = i64::from(routing_num_shards);
    let routing_factor = routing_num_shards / i64::from(number_of_shards);

    let modulo = if hash < 0 {
        let shifted = routing_num_shards - hash.abs();
        let modulo = shifted % routing_num_shards;
        if modulo < 0 {
            modulo + routing_num_shards
        } else {
            modulo
        }
    } else {
        hash % routing_num_shards
    };

    Ok((modulo / routing_factor) as i32)
}

/// 🎯 `shard_id` with derived routing shards and no partitioning.
pub fn shard_id_for(
    es_major_version: u32,
    doc_id: &[u8],
    number_of_shards: i32,
) -> Result<i32, BulkError> {
    shard_id(doc_id, number_of_shards, -1, 1, es_major_version)
}
