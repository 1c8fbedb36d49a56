/// Stateless validation logic for transactions, separated from type definitions
use crate::crypto::{address_from_public_key, is_valid_address, verify_signature_hex};
use crate::error::ChainError;
use crate::transaction::types::{Transaction, MAX_TRANSACTION_SIZE};

impl Transaction {
    /// Validate transaction size to prevent DoS attacks
    pub fn validate_size(&self) -> Result<(), ChainError> {
        let serialized = bincode::serialize(self)
            .map_err(|e| ChainError::InvalidTransaction(format!("Serialization failed: {}", e)))?;

        if serialized.len() > MAX_TRANSACTION_SIZE {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction too large: {} bytes (max: {})",
                serialized.len(),
                MAX_TRANSACTION_SIZE
            )));
        }
        Ok(())
    }

    /// Stateless validation: hash integrity, addresses, memo and signature.
    /// Balance checks happen in the ledger, which owns the state.
    pub fn validate(&self) -> Result<(), ChainError> {
        self.validate_size()?;

        if self.hash != self.calculate_hash() {
            return Err(ChainError::InvalidTransaction(format!(
                "Hash mismatch for transaction {}",
                self.hash
            )));
        }

        if !is_valid_address(&self.to) {
            return Err(ChainError::InvalidTransaction(format!(
                "Recipient is not a 64-character hex address: {}",
                self.to
            )));
        }

        if self.amount == 0 {
            return Err(ChainError::InvalidTransaction(
                "Amount must be greater than zero".to_string(),
            ));
        }

        if let Some(ref memo) = self.data {
            if memo.len() > Self::MAX_MEMO_LENGTH {
                return Err(ChainError::InvalidTransaction(format!(
                    "Memo exceeds maximum length of {} bytes",
                    Self::MAX_MEMO_LENGTH
                )));
            }
        }

        match &self.from {
            None => {
                if self.signature.is_some() {
                    return Err(ChainError::InvalidTransaction(
                        "Reward transactions must not carry a signature".to_string(),
                    ));
                }
                Ok(())
            }
            Some(from) => {
                if !is_valid_address(from) {
                    return Err(ChainError::InvalidTransaction(format!(
                        "Sender is not a 64-character hex address: {}",
                        from
                    )));
                }
                if from == &self.to {
                    return Err(ChainError::InvalidTransaction(
                        "Sender and recipient cannot be the same".to_string(),
                    ));
                }
                self.validate_signature(from)
            }
        }
    }

    fn validate_signature(&self, from: &str) -> Result<(), ChainError> {
        let (signature, public_key) = match (&self.signature, &self.public_key) {
            (Some(sig), Some(pk)) => (sig, pk),
            _ => {
                return Err(ChainError::InvalidTransaction(
                    "Transaction not signed".to_string(),
                ))
            }
        };

        let pk_bytes = hex::decode(public_key)
            .map_err(|e| ChainError::InvalidTransaction(format!("Invalid public key: {}", e)))?;
        if address_from_public_key(&pk_bytes) != from {
            return Err(ChainError::InvalidTransaction(format!(
                "Signing key does not belong to sender {}",
                from
            )));
        }

        verify_signature_hex(public_key, &self.signable_message(), signature)
            .map_err(|e| ChainError::InvalidTransaction(e.to_string()))
    }
}
