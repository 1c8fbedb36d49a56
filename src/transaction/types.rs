/// Transaction types for TopayChain
use crate::crypto::{compute_hash, Address, KeyPair};
use crate::error::ChainError;
use serde::{Deserialize, Serialize};

/// Maximum transaction size in bytes (100KB) to prevent DoS
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

/// A value transfer between two addresses.
///
/// `from == None` marks a system issuance (block reward or genesis
/// allocation); those carry no signature and only ever appear inside blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub from: Option<Address>,
    pub to: Address,
    pub amount: u64,
    pub timestamp: u64,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    pub hash: String,
    #[serde(default)]
    pub nonce: Option<u64>,
    #[serde(default)]
    pub data: Option<String>,
}

impl Transaction {
    /// Maximum memo length (256 bytes)
    pub const MAX_MEMO_LENGTH: usize = 256;

    /// Builds an unsigned transfer stamped with the current time.
    pub fn new(from: Address, to: Address, amount: u64) -> Self {
        Self::with_timestamp(Some(from), to, amount, now_millis())
    }

    /// Builds a reward/issuance transaction. No sender, no signature.
    pub fn reward(to: Address, amount: u64) -> Self {
        Self::with_timestamp(None, to, amount, now_millis())
    }

    pub fn with_timestamp(from: Option<Address>, to: Address, amount: u64, timestamp: u64) -> Self {
        let mut tx = Transaction {
            from,
            to,
            amount,
            timestamp,
            signature: None,
            public_key: None,
            hash: String::new(),
            nonce: None,
            data: None,
        };
        tx.hash = tx.calculate_hash();
        tx
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self.hash = self.calculate_hash();
        self.signature = None;
        self
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Result<Self, ChainError> {
        let memo = memo.into();
        if memo.len() > Self::MAX_MEMO_LENGTH {
            return Err(ChainError::InvalidTransaction(format!(
                "Memo exceeds maximum length of {} bytes",
                Self::MAX_MEMO_LENGTH
            )));
        }
        self.data = Some(memo);
        self.hash = self.calculate_hash();
        self.signature = None;
        Ok(self)
    }

    pub fn is_reward(&self) -> bool {
        self.from.is_none()
    }

    pub fn calculate_hash(&self) -> String {
        let preimage = format!(
            "{}|{}|{}|{}|{}|{}",
            self.from.as_deref().unwrap_or(""),
            self.to,
            self.amount,
            self.timestamp,
            self.nonce.map(|n| n.to_string()).unwrap_or_default(),
            self.data.as_deref().unwrap_or(""),
        );
        compute_hash(preimage.as_bytes())
    }

    /// The bytes covered by the signature.
    pub fn signable_message(&self) -> Vec<u8> {
        self.hash.as_bytes().to_vec()
    }

    /// Signs with `keypair`. The keypair must own the `from` address for the
    /// result to validate.
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<(), ChainError> {
        let signature = keypair.sign(&self.signable_message())?;
        self.signature = Some(hex::encode(signature));
        self.public_key = Some(keypair.public_key_hex());
        Ok(())
    }

    pub fn signed(mut self, keypair: &KeyPair) -> Result<Self, ChainError> {
        self.sign(keypair)?;
        Ok(self)
    }

    /// True when `address` is the sender or the receiver.
    pub fn involves(&self, address: &str) -> bool {
        self.to == address || self.from.as_deref() == Some(address)
    }
}

pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
