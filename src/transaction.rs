//! Transaction module split into types and validation for better modularity

pub mod types;
pub mod validation;

pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{test_address, KeyPair};
    use crate::error::ChainError;

    fn signed_transfer(amount: u64) -> (KeyPair, Transaction) {
        let keypair = KeyPair::generate().unwrap();
        let recipient = KeyPair::generate().unwrap().address();
        let tx = Transaction::new(keypair.address(), recipient, amount)
            .signed(&keypair)
            .unwrap();
        (keypair, tx)
    }

    #[test]
    fn test_tx_validation_success() {
        let (_, tx) = signed_transfer(10);
        assert!(tx.validate().is_ok());
        assert!(!tx.is_reward());
    }

    #[test]
    fn test_unsigned_transaction_fails() {
        let keypair = KeyPair::generate().unwrap();
        let tx = Transaction::new(keypair.address(), test_address("bob"), 5);
        let err = tx.validate().unwrap_err();
        assert!(matches!(err, ChainError::InvalidTransaction(_)));
        assert!(err.to_string().contains("not signed"));
    }

    #[test]
    fn test_signature_from_foreign_key_fails() {
        let owner = KeyPair::generate().unwrap();
        let thief = KeyPair::generate().unwrap();
        let tx = Transaction::new(owner.address(), test_address("bob"), 5)
            .signed(&thief)
            .unwrap();
        let err = tx.validate().unwrap_err();
        assert!(err.to_string().contains("does not belong to sender"));
    }

    #[test]
    fn test_tampered_amount_fails() {
        let (_, mut tx) = signed_transfer(10);
        tx.amount = 1_000;
        let err = tx.validate().unwrap_err();
        assert!(err.to_string().contains("Hash mismatch"));
    }

    #[test]
    fn test_zero_amount_and_self_send_rejected() {
        let keypair = KeyPair::generate().unwrap();
        let zero = Transaction::new(keypair.address(), test_address("bob"), 0)
            .signed(&keypair)
            .unwrap();
        assert!(zero.validate().is_err());

        let self_send = Transaction::new(keypair.address(), keypair.address(), 3)
            .signed(&keypair)
            .unwrap();
        assert!(self_send
            .validate()
            .unwrap_err()
            .to_string()
            .contains("cannot be the same"));
    }

    #[test]
    fn test_malformed_addresses_rejected() {
        let keypair = KeyPair::generate().unwrap();
        let colon = Transaction::new(keypair.address(), format!("{}:x", test_address("bob")), 1)
            .signed(&keypair)
            .unwrap();
        assert!(colon.validate().is_err());

        let short = Transaction::new(keypair.address(), "bob".to_string(), 1)
            .signed(&keypair)
            .unwrap();
        assert!(short.validate().is_err());

        assert!(Transaction::reward("m:x".to_string(), 50).validate().is_err());
    }

    #[test]
    fn test_memo_length_limit() {
        let keypair = KeyPair::generate().unwrap();
        let long_memo = "x".repeat(Transaction::MAX_MEMO_LENGTH + 1);
        let result = Transaction::new(keypair.address(), test_address("bob"), 1).with_memo(long_memo);
        assert!(result.is_err());
    }

    #[test]
    fn test_reward_transaction_is_valid_without_signature() {
        let tx = Transaction::reward(test_address("miner"), 50);
        assert!(tx.is_reward());
        assert!(tx.validate().is_ok());
    }

    #[test]
    fn test_hash_changes_with_nonce_and_memo() {
        let keypair = KeyPair::generate().unwrap();
        let base = Transaction::new(keypair.address(), test_address("bob"), 1);
        let with_nonce = base.clone().with_nonce(7);
        let with_memo = base.clone().with_memo("rent").unwrap();
        assert_ne!(base.hash, with_nonce.hash);
        assert_ne!(base.hash, with_memo.hash);
        assert!(with_nonce.signature.is_none());
    }

    #[test]
    fn test_json_field_names() {
        let (_, tx) = signed_transfer(3);
        let json = serde_json::to_value(&tx).unwrap();
        assert!(json["publicKey"].is_string());
        assert!(json["from"].is_string());
        assert_eq!(json["amount"], 3);
    }
}
