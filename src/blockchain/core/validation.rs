use crate::error::ChainError;
use crate::miner::hash_meets_difficulty;
use std::collections::HashSet;

use super::chain::Block;

/// Stored hash and merkle root must match their recomputation.
pub fn validate_block_integrity(block: &Block) -> Result<(), ChainError> {
    let expected_merkle = Block::calculate_merkle_root(&block.transactions);
    if block.merkle_root != expected_merkle {
        return Err(ChainError::InvalidBlock(format!(
            "Merkle root mismatch at block {}. Expected {}, but got {}.",
            block.index, expected_merkle, block.merkle_root
        )));
    }

    let expected_hash = block.calculate_hash();
    if block.hash != expected_hash {
        return Err(ChainError::InvalidBlock(format!(
            "Hash mismatch at block {}. Expected {}, but got {}.",
            block.index, expected_hash, block.hash
        )));
    }
    Ok(())
}

pub fn validate_link(previous: &Block, block: &Block) -> Result<(), ChainError> {
    if block.index != previous.index + 1 {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid block index. Expected {}, but got {}.",
            previous.index + 1,
            block.index
        )));
    }
    if block.previous_hash != previous.hash {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid previous block hash at block {}. Expected {}, but got {}.",
            block.index, previous.hash, block.previous_hash
        )));
    }
    Ok(())
}

pub fn validate_proof_of_work(block: &Block) -> Result<(), ChainError> {
    if !hash_meets_difficulty(&block.hash, block.difficulty) {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid Proof-of-Work: block {} hash does not have {} leading zeros.",
            block.index, block.difficulty
        )));
    }
    Ok(())
}

pub fn validate_no_duplicate_transactions(block: &Block) -> Result<(), ChainError> {
    let mut seen = HashSet::new();
    for tx in &block.transactions {
        if !seen.insert(tx.hash.as_str()) {
            return Err(ChainError::InvalidBlock(format!(
                "Transaction {} appears twice in block {}",
                tx.hash, block.index
            )));
        }
    }
    Ok(())
}

/// Walks the chain and stops at the first broken block.
pub fn validate_chain(blocks: &[Block]) -> Result<(), ChainError> {
    let genesis = blocks
        .first()
        .ok_or_else(|| ChainError::InvalidBlock("Chain has no genesis block".to_string()))?;
    if genesis.index != 0 {
        return Err(ChainError::InvalidBlock(format!(
            "Genesis block must have index 0, got {}",
            genesis.index
        )));
    }
    validate_block_integrity(genesis)?;

    for pair in blocks.windows(2) {
        validate_block_integrity(&pair[1])?;
        validate_link(&pair[0], &pair[1])?;
    }
    Ok(())
}
