//! # Command Wire Codec
//!
//! A script input's `script` bytes are a framed marketplace command:
//!
//! ```text
//! [protocol_version: u32 LE][command_type: u8][payload: bincode]
//! ```
//!
//! The five-byte header lets callers classify a command without parsing
//! its payload ([`command_type`]), and lets old nodes reject commands
//! from a protocol they do not speak before touching the payload at all.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::PROTOCOL_VERSION;
use crate::error::CommandParseError;

/// Size of the `[version][type]` frame header.
const HEADER_LEN: usize = 5;

// ---------------------------------------------------------------------------
// CommandType
// ---------------------------------------------------------------------------

/// Discriminant of a framed command, readable without payload parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    CreateAccount,
    EditAccount,
    StakeToken,
    UnstakeToken,
    DonateNetworkFee,
    CreateOffer,
    EditOffer,
    Purchase,
    Feedback,
    CreatePricePeg,
    UpdatePricePeg,
}

impl CommandType {
    /// Wire tag for this command type.
    pub fn tag(&self) -> u8 {
        match self {
            CommandType::CreateAccount => 1,
            CommandType::EditAccount => 2,
            CommandType::StakeToken => 3,
            CommandType::UnstakeToken => 4,
            CommandType::DonateNetworkFee => 5,
            CommandType::CreateOffer => 6,
            CommandType::EditOffer => 7,
            CommandType::Purchase => 8,
            CommandType::Feedback => 9,
            CommandType::CreatePricePeg => 10,
            CommandType::UpdatePricePeg => 11,
        }
    }

    /// Parse a wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(CommandType::CreateAccount),
            2 => Some(CommandType::EditAccount),
            3 => Some(CommandType::StakeToken),
            4 => Some(CommandType::UnstakeToken),
            5 => Some(CommandType::DonateNetworkFee),
            6 => Some(CommandType::CreateOffer),
            7 => Some(CommandType::EditOffer),
            8 => Some(CommandType::Purchase),
            9 => Some(CommandType::Feedback),
            10 => Some(CommandType::CreatePricePeg),
            11 => Some(CommandType::UpdatePricePeg),
            _ => None,
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Register a new account under a unique username.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountCmd {
    /// Requested username, lowercase `[a-z0-9_-]`.
    pub username: String,
    /// Account public key.
    pub pubkey: [u8; 32],
    /// Opaque account data blob.
    pub data: Vec<u8>,
}

/// Replace an existing account's data blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditAccountCmd {
    /// Account to edit.
    pub username: String,
    /// New data blob, full overwrite.
    pub data: Vec<u8>,
}

/// Lock tokens to earn interval interest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeTokenCmd {
    /// Staker public key.
    pub pubkey: [u8; 32],
    /// Atomic token units to lock. Must be a whole-token multiple and at
    /// least the minimum stake.
    pub token_amount: u64,
}

/// Release a matured stake and claim its interest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnstakeTokenCmd {
    /// Atomic token units being released, must equal the staked amount.
    pub token_amount: u64,
}

/// Voluntary cash contribution to the staking interest pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonateNetworkFeeCmd {
    /// Atomic cash units donated.
    pub amount: u64,
}

/// List a new offer for sale.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOfferCmd {
    /// Content-derived offer id, see [`records::derive_offer_id`](super::records::derive_offer_id).
    pub offer_id: [u8; 32],
    /// Selling account's username.
    pub seller: String,
    /// Offer title.
    pub title: String,
    /// Opaque description blob.
    pub description: Vec<u8>,
    /// Listed price (atomic cash units, or peg currency units if pegged).
    pub price: u64,
    /// Seller's acceptable floor.
    pub min_price: u64,
    /// Units offered.
    pub quantity: u64,
    /// Peg to quote against, if any.
    pub price_peg_id: Option<[u8; 32]>,
    /// Whether the peg is actually applied to the price.
    pub price_peg_used: bool,
    /// Seller's public key.
    pub seller_pubkey: [u8; 32],
}

/// Update an offer's mutable fields, full overwrite.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOfferCmd {
    /// Offer to edit.
    pub offer_id: [u8; 32],
    /// Seller username, must match the record.
    pub seller: String,
    /// New title.
    pub title: String,
    /// New description blob.
    pub description: Vec<u8>,
    /// New price.
    pub price: u64,
    /// New floor.
    pub min_price: u64,
    /// New stock count.
    pub quantity: u64,
    /// New peg linkage.
    pub price_peg_id: Option<[u8; 32]>,
    /// New peg toggle.
    pub price_peg_used: bool,
    /// Offers are closed by editing `active` off.
    pub active: bool,
}

/// Buy units from an offer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseCmd {
    /// Offer being bought from.
    pub offer_id: [u8; 32],
    /// Units bought.
    pub quantity: u64,
    /// Total cash the buyer pays, must cover the effective price.
    pub price_paid: u64,
}

/// Rate a purchased offer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackCmd {
    /// Offer being rated.
    pub offer_id: [u8; 32],
    /// Rating in 0..=3.
    pub stars_given: u8,
    /// Opaque comment blob.
    pub comment: Vec<u8>,
}

/// Publish a new price peg.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePricePegCmd {
    /// Content-derived peg id.
    pub price_peg_id: [u8; 32],
    /// Peg title.
    pub title: String,
    /// Maintaining account's username.
    pub creator: String,
    /// Currency ticker, at most 8 bytes.
    pub currency: String,
    /// Atomic cash units per currency unit, scaled by `COIN`.
    pub rate: u64,
    /// Opaque peg metadata.
    pub data: Vec<u8>,
}

/// Move an existing peg's rate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePricePegCmd {
    /// Peg to update.
    pub price_peg_id: [u8; 32],
    /// New rate.
    pub rate: u64,
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A parsed marketplace command, one variant per [`CommandType`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    CreateAccount(CreateAccountCmd),
    EditAccount(EditAccountCmd),
    StakeToken(StakeTokenCmd),
    UnstakeToken(UnstakeTokenCmd),
    DonateNetworkFee(DonateNetworkFeeCmd),
    CreateOffer(CreateOfferCmd),
    EditOffer(EditOfferCmd),
    Purchase(PurchaseCmd),
    Feedback(FeedbackCmd),
    CreatePricePeg(CreatePricePegCmd),
    UpdatePricePeg(UpdatePricePegCmd),
}

impl Command {
    /// The command's type discriminant.
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::CreateAccount(_) => CommandType::CreateAccount,
            Command::EditAccount(_) => CommandType::EditAccount,
            Command::StakeToken(_) => CommandType::StakeToken,
            Command::UnstakeToken(_) => CommandType::UnstakeToken,
            Command::DonateNetworkFee(_) => CommandType::DonateNetworkFee,
            Command::CreateOffer(_) => CommandType::CreateOffer,
            Command::EditOffer(_) => CommandType::EditOffer,
            Command::Purchase(_) => CommandType::Purchase,
            Command::Feedback(_) => CommandType::Feedback,
            Command::CreatePricePeg(_) => CommandType::CreatePricePeg,
            Command::UpdatePricePeg(_) => CommandType::UpdatePricePeg,
        }
    }

    /// Frame this command for the wire.
    pub fn serialize(&self) -> Result<Vec<u8>, CommandParseError> {
        let payload = match self {
            Command::CreateAccount(cmd) => bincode::serialize(cmd),
            Command::EditAccount(cmd) => bincode::serialize(cmd),
            Command::StakeToken(cmd) => bincode::serialize(cmd),
            Command::UnstakeToken(cmd) => bincode::serialize(cmd),
            Command::DonateNetworkFee(cmd) => bincode::serialize(cmd),
            Command::CreateOffer(cmd) => bincode::serialize(cmd),
            Command::EditOffer(cmd) => bincode::serialize(cmd),
            Command::Purchase(cmd) => bincode::serialize(cmd),
            Command::Feedback(cmd) => bincode::serialize(cmd),
            Command::CreatePricePeg(cmd) => bincode::serialize(cmd),
            Command::UpdatePricePeg(cmd) => bincode::serialize(cmd),
        }
        .map_err(|e| CommandParseError::Payload(e.to_string()))?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        bytes.push(self.command_type().tag());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Parse a framed command. Rejects foreign protocol versions and
    /// unknown type tags before touching the payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, CommandParseError> {
        let (ty, payload) = split_frame(bytes)?;
        let version = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if version != PROTOCOL_VERSION {
            return Err(CommandParseError::UnsupportedVersion {
                found: version,
                expected: PROTOCOL_VERSION,
            });
        }

        let payload_err = |e: bincode::Error| CommandParseError::Payload(e.to_string());
        Ok(match ty {
            CommandType::CreateAccount => {
                Command::CreateAccount(bincode::deserialize(payload).map_err(payload_err)?)
            }
            CommandType::EditAccount => {
                Command::EditAccount(bincode::deserialize(payload).map_err(payload_err)?)
            }
            CommandType::StakeToken => {
                Command::StakeToken(bincode::deserialize(payload).map_err(payload_err)?)
            }
            CommandType::UnstakeToken => {
                Command::UnstakeToken(bincode::deserialize(payload).map_err(payload_err)?)
            }
            CommandType::DonateNetworkFee => {
                Command::DonateNetworkFee(bincode::deserialize(payload).map_err(payload_err)?)
            }
            CommandType::CreateOffer => {
                Command::CreateOffer(bincode::deserialize(payload).map_err(payload_err)?)
            }
            CommandType::EditOffer => {
                Command::EditOffer(bincode::deserialize(payload).map_err(payload_err)?)
            }
            CommandType::Purchase => {
                Command::Purchase(bincode::deserialize(payload).map_err(payload_err)?)
            }
            CommandType::Feedback => {
                Command::Feedback(bincode::deserialize(payload).map_err(payload_err)?)
            }
            CommandType::CreatePricePeg => {
                Command::CreatePricePeg(bincode::deserialize(payload).map_err(payload_err)?)
            }
            CommandType::UpdatePricePeg => {
                Command::UpdatePricePeg(bincode::deserialize(payload).map_err(payload_err)?)
            }
        })
    }
}

/// Classify a framed command by its header alone. Cheap: no payload
/// allocation, no version gate.
pub fn command_type(bytes: &[u8]) -> Result<CommandType, CommandParseError> {
    split_frame(bytes).map(|(ty, _)| ty)
}

fn split_frame(bytes: &[u8]) -> Result<(CommandType, &[u8]), CommandParseError> {
    if bytes.len() < HEADER_LEN {
        return Err(CommandParseError::Truncated {
            got: bytes.len(),
            need: HEADER_LEN,
        });
    }
    let ty = CommandType::from_tag(bytes[4])
        .ok_or(CommandParseError::UnknownCommandType(bytes[4]))?;
    Ok((ty, &bytes[HEADER_LEN..]))
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// What a successfully executed command produced, per command type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Account registered.
    AccountCreated {
        /// The registered username.
        username: String,
    },
    /// Account data replaced.
    AccountEdited {
        /// The edited username.
        username: String,
    },
    /// Tokens locked.
    TokenStaked {
        /// Atomic token units locked.
        token_amount: u64,
        /// Height the lock starts counting from.
        block_height: u64,
    },
    /// Tokens released.
    TokenUnstaked {
        /// Atomic token units released.
        token_amount: u64,
        /// Interest paid out alongside the principal, atomic cash units.
        interest: u64,
    },
    /// Cash donated to the fee pool.
    NetworkFeeDonated {
        /// Atomic cash units added to the current interval's pool.
        amount: u64,
    },
    /// Offer listed.
    OfferCreated {
        /// The new offer's id.
        offer_id: [u8; 32],
    },
    /// Offer updated.
    OfferEdited {
        /// The edited offer's id.
        offer_id: [u8; 32],
    },
    /// Purchase completed.
    Purchased {
        /// Units left in stock after this purchase.
        quantity_remaining: u64,
        /// The 5% cut routed to the fee pool, atomic cash units.
        network_fee: u64,
    },
    /// Feedback recorded.
    FeedbackGiven {
        /// The rated offer's id.
        offer_id: [u8; 32],
        /// Stars recorded.
        stars_given: u8,
    },
    /// Peg published.
    PricePegCreated {
        /// The new peg's id.
        price_peg_id: [u8; 32],
    },
    /// Peg rate moved.
    PricePegUpdated {
        /// The updated peg's id.
        price_peg_id: [u8; 32],
        /// The rate now in force.
        rate: u64,
    },
}
