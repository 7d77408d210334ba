//! # Transactions, Inputs, Outputs
//!
//! A transaction spends inputs and creates outputs. Three input flavors:
//! cash key inputs, token key inputs, and script inputs — the latter
//! carry a serialized marketplace [command](crate::market::Command) in
//! their `script` bytes.
//!
//! Outputs come in two addressing schemes:
//!
//! - **Amount-bucketed** (`Key`, `TokenKey`): indexed by
//!   `(amount, local index)`, the classic ring-signature denomination
//!   scheme.
//! - **Advanced** (`Script`): indexed by a global monotonically
//!   increasing output id and tagged with an [`OutputType`], carrying an
//!   opaque type-specific data blob.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// OutputType
// ---------------------------------------------------------------------------

/// Type tag for advanced (script-carrying) outputs.
///
/// The tag routes an output to the correct table and the correct command
/// handler. Stored alongside the output record in
/// `output_advanced_type`, so classification never requires parsing the
/// data blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputType {
    /// Tokens locked for interval interest.
    TokenStake,
    /// A marketplace account record.
    Account,
    /// A sellable offer.
    Offer,
    /// A completed purchase against an offer.
    Purchase,
    /// Feedback left on an offer.
    Feedback,
    /// The token a buyer receives entitling them to leave feedback.
    FeedbackToken,
    /// An externally reported exchange rate.
    PricePeg,
    /// The 5% purchase cut feeding the staking interest pool.
    NetworkFee,
    /// Tokens migrated in from the Bitcoin-side burn contract.
    TokenMigration,
}

impl OutputType {
    /// Wire tag for this type.
    pub fn tag(&self) -> u8 {
        match self {
            OutputType::TokenStake => 1,
            OutputType::Account => 2,
            OutputType::Offer => 3,
            OutputType::Purchase => 4,
            OutputType::Feedback => 5,
            OutputType::FeedbackToken => 6,
            OutputType::PricePeg => 7,
            OutputType::NetworkFee => 8,
            OutputType::TokenMigration => 9,
        }
    }

    /// Parse a wire tag. Unknown tags are `None` — never a panic.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(OutputType::TokenStake),
            2 => Some(OutputType::Account),
            3 => Some(OutputType::Offer),
            4 => Some(OutputType::Purchase),
            5 => Some(OutputType::Feedback),
            6 => Some(OutputType::FeedbackToken),
            7 => Some(OutputType::PricePeg),
            8 => Some(OutputType::NetworkFee),
            9 => Some(OutputType::TokenMigration),
            _ => None,
        }
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ---------------------------------------------------------------------------
// TxInput
// ---------------------------------------------------------------------------

/// One spend in a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxInput {
    /// Spend of an amount-bucketed cash output.
    Cash {
        /// Cash amount in atomic units.
        amount: u64,
        /// Ring member offsets within the amount bucket.
        key_offsets: Vec<u64>,
        /// Double-spend marker, unique per spent output.
        key_image: [u8; 32],
    },
    /// Spend of an amount-bucketed token output.
    Token {
        /// Token amount in atomic units.
        token_amount: u64,
        /// Ring member offsets within the token amount bucket.
        key_offsets: Vec<u64>,
        /// Double-spend marker.
        key_image: [u8; 32],
    },
    /// A script input carrying a marketplace command.
    Script {
        /// Cash amount the command claims (e.g. interest on unstake,
        /// donation amount).
        amount: u64,
        /// Token amount the command locks or releases.
        token_amount: u64,
        /// Advanced output ids this command references (absolute).
        key_offsets: Vec<u64>,
        /// Double-spend marker.
        key_image: [u8; 32],
        /// Serialized command, see [`crate::market::Command`].
        script: Vec<u8>,
    },
}

impl TxInput {
    /// The input's key image.
    pub fn key_image(&self) -> &[u8; 32] {
        match self {
            TxInput::Cash { key_image, .. }
            | TxInput::Token { key_image, .. }
            | TxInput::Script { key_image, .. } => key_image,
        }
    }
}

// ---------------------------------------------------------------------------
// TxOutput
// ---------------------------------------------------------------------------

/// Where an output's value lands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputTarget {
    /// Plain cash output to a one-time public key.
    Key {
        /// One-time destination key.
        key: [u8; 32],
    },
    /// Plain token output to a one-time public key.
    TokenKey {
        /// One-time destination key.
        key: [u8; 32],
    },
    /// Advanced output: typed, script-carrying.
    Script {
        /// One-time destination key.
        key: [u8; 32],
        /// Which marketplace entity this output represents.
        output_type: OutputType,
        /// Opaque type-specific payload (usually the command bytes that
        /// produced this output's state).
        data: Vec<u8>,
    },
}

/// One output of a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Cash amount in atomic units (0 for pure token outputs).
    pub amount: u64,
    /// Token amount in atomic units (0 for pure cash outputs).
    pub token_amount: u64,
    /// Addressing scheme and payload.
    pub target: OutputTarget,
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A full transaction: version, lock, inputs, outputs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction format version.
    pub version: u8,
    /// Block height (or timestamp) before which outputs cannot be spent.
    pub unlock_time: u64,
    /// Ordered inputs.
    pub inputs: Vec<TxInput>,
    /// Ordered outputs.
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// BLAKE3 hash of the canonical encoding. See the note on
    /// [`Block::hash`](crate::chain::Block::hash) for why this does not
    /// return a `Result`.
    pub fn hash(&self) -> [u8; 32] {
        let bytes = bincode::serialize(self).unwrap_or_default();
        *blake3::hash(&bytes).as_bytes()
    }

    /// Hex-encoded transaction hash, for logs.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }

    /// Iterator over the script inputs (the ones carrying commands).
    pub fn script_inputs(&self) -> impl Iterator<Item = &TxInput> {
        self.inputs
            .iter()
            .filter(|input| matches!(input, TxInput::Script { .. }))
    }

    /// The first advanced output of the given type, with its index in
    /// the output list. Commands anchor their effects to the matching
    /// output of their own transaction.
    pub fn script_output_of_type(&self, wanted: OutputType) -> Option<(usize, &TxOutput)> {
        self.outputs.iter().enumerate().find(|(_, out)| {
            matches!(&out.target, OutputTarget::Script { output_type, .. } if *output_type == wanted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            unlock_time: 0,
            inputs: vec![
                TxInput::Cash {
                    amount: 500,
                    key_offsets: vec![1, 2, 3],
                    key_image: [9u8; 32],
                },
                TxInput::Script {
                    amount: 0,
                    token_amount: 100,
                    key_offsets: vec![],
                    key_image: [8u8; 32],
                    script: vec![1, 2, 3],
                },
            ],
            outputs: vec![
                TxOutput {
                    amount: 400,
                    token_amount: 0,
                    target: OutputTarget::Key { key: [1u8; 32] },
                },
                TxOutput {
                    amount: 0,
                    token_amount: 100,
                    target: OutputTarget::Script {
                        key: [2u8; 32],
                        output_type: OutputType::TokenStake,
                        data: vec![],
                    },
                },
            ],
        }
    }

    #[test]
    fn output_type_tags_roundtrip() {
        let all = [
            OutputType::TokenStake,
            OutputType::Account,
            OutputType::Offer,
            OutputType::Purchase,
            OutputType::Feedback,
            OutputType::FeedbackToken,
            OutputType::PricePeg,
            OutputType::NetworkFee,
            OutputType::TokenMigration,
        ];
        for ty in all {
            assert_eq!(OutputType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(OutputType::from_tag(0), None);
        assert_eq!(OutputType::from_tag(200), None);
    }

    #[test]
    fn script_inputs_are_filtered() {
        let tx = sample_tx();
        assert_eq!(tx.script_inputs().count(), 1);
    }

    #[test]
    fn script_output_lookup_by_type() {
        let tx = sample_tx();
        let (vout, out) = tx.script_output_of_type(OutputType::TokenStake).unwrap();
        assert_eq!(vout, 1);
        assert_eq!(out.token_amount, 100);
        assert!(tx.script_output_of_type(OutputType::Offer).is_none());
    }

    #[test]
    fn hash_is_stable_and_collision_free_for_distinct_txs() {
        let a = sample_tx();
        let mut b = sample_tx();
        b.unlock_time = 10;
        assert_eq!(a.hash(), sample_tx().hash());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn key_image_accessor_covers_all_variants() {
        let tx = sample_tx();
        assert_eq!(tx.inputs[0].key_image(), &[9u8; 32]);
        assert_eq!(tx.inputs[1].key_image(), &[8u8; 32]);
    }

    #[test]
    fn transaction_serde_roundtrip() {
        let tx = sample_tx();
        let bytes = bincode::serialize(&tx).unwrap();
        let recovered: Transaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(tx, recovered);
    }
}
