//! Proof-of-work search
//!
//! A block is mined once its hex hash starts with `difficulty` zero digits.

use crate::blockchain::Block;
use crate::error::ChainError;

/// Highest difficulty the miner accepts; a SHA-256 hex digest has 64 digits.
pub const MAX_POW_DIFFICULTY: u32 = 64;

pub fn hash_meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

/// Increments the nonce until the block hash satisfies its difficulty.
pub fn mine_block(mut block: Block) -> Result<Block, ChainError> {
    if block.difficulty == 0 || block.difficulty > MAX_POW_DIFFICULTY {
        return Err(ChainError::InvalidBlock(format!(
            "Difficulty {} outside 1..={}",
            block.difficulty, MAX_POW_DIFFICULTY
        )));
    }

    block.nonce = 0;
    loop {
        block.hash = block.calculate_hash();
        if hash_meets_difficulty(&block.hash, block.difficulty) {
            return Ok(block);
        }
        block.nonce = block.nonce.checked_add(1).ok_or_else(|| {
            ChainError::InvalidBlock("Nonce space exhausted while mining".to_string())
        })?;
    }
}
