//! # Block Structure
//!
//! A block is a header plus the ordered list of hashes of the
//! transactions it contains. Full transactions travel alongside the block
//! through `add_block` and are stored under their own table — the block
//! record itself stays small.
//!
//! ## Hash Computation
//!
//! The block hash is the BLAKE3 digest of the header's canonical bincode
//! encoding. Difficulty, size, and cumulative totals are *not* part of
//! the header — the consensus layer derives them and passes them to
//! `add_block`, which stores them in the `block_info` table.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BlockHeader
// ---------------------------------------------------------------------------

/// Chain linkage and proof-of-work fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Hard-fork version this block was produced under.
    pub version: u8,
    /// Hash of the parent block. All zeros for genesis.
    pub prev_hash: [u8; 32],
    /// Unix timestamp (seconds) when this block was produced.
    pub timestamp: u64,
    /// Proof-of-work nonce. Opaque to the storage engine.
    pub nonce: u32,
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A full block: header plus ordered transaction hashes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Header fields covered by the block hash.
    pub header: BlockHeader,
    /// Hashes of the transactions in this block, in consensus order.
    pub tx_hashes: Vec<[u8; 32]>,
}

impl Block {
    /// Construct the genesis block. Height 0, zero parent, no
    /// transactions.
    pub fn genesis() -> Self {
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash: [0u8; 32],
                timestamp: 0,
                nonce: 0,
            },
            tx_hashes: Vec::new(),
        }
    }

    /// BLAKE3 hash of the canonical header encoding.
    ///
    /// Header encoding is infallible for this struct (fixed-size fields
    /// only), so a serialization failure here would mean a bincode bug —
    /// we fall back to hashing an empty buffer rather than panicking in
    /// a hash accessor.
    pub fn hash(&self) -> [u8; 32] {
        let bytes = bincode::serialize(&self.header).unwrap_or_default();
        *blake3::hash(&bytes).as_bytes()
    }

    /// Hex-encoded block hash, for logs.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_has_zero_parent() {
        let genesis = Block::genesis();
        assert_eq!(genesis.header.prev_hash, [0u8; 32]);
        assert!(genesis.tx_hashes.is_empty());
    }

    #[test]
    fn hash_changes_with_header() {
        let a = Block::genesis();
        let mut b = Block::genesis();
        b.header.nonce = 42;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn hash_ignores_tx_hashes() {
        // The tx merkle linkage is consensus business; the storage hash
        // covers the header only.
        let a = Block::genesis();
        let mut b = Block::genesis();
        b.tx_hashes.push([7u8; 32]);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn block_serde_roundtrip() {
        let mut block = Block::genesis();
        block.header.timestamp = 1_700_000_000;
        block.tx_hashes.push([3u8; 32]);
        let bytes = bincode::serialize(&block).unwrap();
        let recovered: Block = bincode::deserialize(&bytes).unwrap();
        assert_eq!(block, recovered);
    }
}
