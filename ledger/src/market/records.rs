//! # Marketplace Entity Records
//!
//! The persisted state of accounts, offers, feedback, and price pegs.
//!
//! Each record carries an append-only `outputs` history: the global ids
//! of the advanced outputs whose commands produced each successive state.
//! Rollback never patches a record in place — it pops the history and
//! replays the surviving outputs' payloads (see
//! [`execute`](super::execute)), so a record is always exactly the fold
//! of its history.

use serde::{Deserialize, Serialize};

use crate::config::COIN;

// ---------------------------------------------------------------------------
// AccountRecord
// ---------------------------------------------------------------------------

/// A marketplace user account, keyed by username.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Unique lowercase username.
    pub username: String,
    /// The account's public key.
    pub pubkey: [u8; 32],
    /// Opaque account data (profile blob, wallet-defined).
    pub data: Vec<u8>,
    /// Advanced output ids that produced each state, oldest first.
    pub outputs: Vec<u64>,
}

// ---------------------------------------------------------------------------
// OfferRecord
// ---------------------------------------------------------------------------

/// A sellable offer, keyed by a content-derived 32-byte id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferRecord {
    /// Content-derived offer id.
    pub offer_id: [u8; 32],
    /// Username of the selling account.
    pub seller: String,
    /// Short human-readable title.
    pub title: String,
    /// Opaque description blob.
    pub description: Vec<u8>,
    /// Units remaining in stock.
    pub quantity: u64,
    /// Listed price in atomic cash units — or, when pegged, in the peg's
    /// currency units (converted by [`effective_price`](Self::effective_price)).
    pub price: u64,
    /// The floor the seller will accept.
    pub min_price: u64,
    /// Price peg this offer is quoted against, if any.
    pub price_peg_id: Option<[u8; 32]>,
    /// Whether the peg is in use (a peg id may be carried but dormant).
    pub price_peg_used: bool,
    /// Sellers close offers by flipping this off.
    pub active: bool,
    /// The seller's public key, denormalized for quick lookup.
    pub seller_pubkey: [u8; 32],
    /// Advanced output ids that produced each state, oldest first.
    pub outputs: Vec<u64>,
}

impl OfferRecord {
    /// The price a buyer actually pays per unit, in atomic cash units.
    ///
    /// For a pegged offer, `price` is quoted in the peg's currency and
    /// converted through the peg's rate (atomic cash units per currency
    /// unit, scaled by [`COIN`]). Integer math, rounding down.
    pub fn effective_price(&self, peg_rate: Option<u64>) -> u64 {
        match (self.price_peg_used, peg_rate) {
            (true, Some(rate)) => (self.price as u128 * rate as u128 / COIN as u128) as u64,
            _ => self.price,
        }
    }
}

// ---------------------------------------------------------------------------
// FeedbackRecord
// ---------------------------------------------------------------------------

/// One piece of feedback left on an offer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    /// Rating in 0..=3.
    pub stars: u8,
    /// Opaque comment blob.
    pub comment: Vec<u8>,
    /// Advanced output id of the feedback output.
    pub output_id: u64,
}

/// All feedback for one offer, keyed by the offer id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FeedbackRecord {
    /// Entries in block order.
    pub entries: Vec<FeedbackEntry>,
}

impl FeedbackRecord {
    /// Sum and count of stars — callers derive the average themselves so
    /// the engine never deals in fractions.
    pub fn stars(&self) -> (u64, u64) {
        let sum = self.entries.iter().map(|e| e.stars as u64).sum();
        (sum, self.entries.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// PricePegRecord
// ---------------------------------------------------------------------------

/// An externally reported exchange rate, keyed by a content-derived id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePegRecord {
    /// Content-derived peg id.
    pub peg_id: [u8; 32],
    /// Human-readable peg title.
    pub title: String,
    /// Username of the account maintaining this peg.
    pub creator: String,
    /// Currency ticker the peg reports ("USD", "EUR", ...).
    pub currency: String,
    /// Atomic cash units per currency unit, scaled by [`COIN`].
    pub rate: u64,
    /// Opaque peg metadata.
    pub data: Vec<u8>,
    /// Advanced output ids that produced each state, oldest first.
    pub outputs: Vec<u64>,
}

// ---------------------------------------------------------------------------
// Id derivation
// ---------------------------------------------------------------------------

/// Derive a content-based offer id from the seller, title, and a
/// wallet-chosen seed (so a seller can relist the same title).
pub fn derive_offer_id(seller: &str, title: &str, seed: u64) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"agora.offer");
    hasher.update(seller.as_bytes());
    hasher.update(&[0]);
    hasher.update(title.as_bytes());
    hasher.update(&seed.to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// Derive a content-based price peg id from the creator and title.
pub fn derive_price_peg_id(creator: &str, title: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"agora.price_peg");
    hasher.update(creator.as_bytes());
    hasher.update(&[0]);
    hasher.update(title.as_bytes());
    *hasher.finalize().as_bytes()
}
