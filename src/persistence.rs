//! Block storage for VaultChain
//!
//! The chain manager only talks to storage through [`BlockStore`]; it makes no
//! assumption about the technology behind it.

use crate::blockchain::Block;
use crate::error::ChainError;
use crate::transaction::Transaction;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

/// Storage hooks consumed by the chain manager.
pub trait BlockStore: Send + Sync {
    fn on_block_appended(&self, block: &Block) -> Result<(), ChainError>;
    /// Replaces everything stored with `blocks`, atomically.
    fn on_chain_replaced(&self, blocks: &[Block]) -> Result<(), ChainError>;
    fn latest_block(&self) -> Result<Option<Block>, ChainError>;
    /// All stored blocks in index order.
    fn load_blocks(&self) -> Result<Vec<Block>, ChainError>;
}

const BLOCK_COLUMNS: &str =
    "block_index, timestamp, transactions, previous_hash, hash, nonce, signature, validator";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                block_index INTEGER PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                transactions TEXT NOT NULL,
                previous_hash TEXT NOT NULL,
                hash TEXT NOT NULL,
                nonce INTEGER NOT NULL,
                signature TEXT NOT NULL,
                validator TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create blocks table: {}", e)))?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, ChainError> {
        Self::open(":memory:")
    }

    fn insert_block(conn: &Connection, block: &Block) -> Result<(), ChainError> {
        let transactions_json = serde_json::to_string(&block.transactions).map_err(|e| {
            ChainError::DatabaseError(format!("Failed to serialize transactions: {}", e))
        })?;

        conn.execute(
            "INSERT OR REPLACE INTO blocks
                (block_index, timestamp, transactions, previous_hash,
                 hash, nonce, signature, validator)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                block.index as i64,
                block.timestamp as i64,
                transactions_json,
                block.previous_hash,
                block.hash,
                block.nonce as i64,
                block.signature,
                block.validator,
            ],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save block: {}", e)))?;

        Ok(())
    }

    fn row_to_block(row: &Row<'_>) -> rusqlite::Result<Block> {
        let index: i64 = row.get(0)?;
        let timestamp: i64 = row.get(1)?;
        let transactions_json: String = row.get(2)?;
        let nonce: i64 = row.get(5)?;

        let transactions: Vec<Transaction> =
            serde_json::from_str(&transactions_json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;

        Ok(Block {
            index: index as u64,
            timestamp: timestamp as u64,
            transactions,
            previous_hash: row.get(3)?,
            hash: row.get(4)?,
            nonce: nonce as u64,
            signature: row.get(6)?,
            validator: row.get(7)?,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ChainError> {
        self.conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }
}

impl BlockStore for Database {
    fn on_block_appended(&self, block: &Block) -> Result<(), ChainError> {
        let conn = self.lock()?;
        Self::insert_block(&conn, block)
    }

    fn on_chain_replaced(&self, blocks: &[Block]) -> Result<(), ChainError> {
        let conn_guard = self.lock()?;
        let tx = conn_guard.unchecked_transaction().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to start transaction: {}", e))
        })?;

        tx.execute("DELETE FROM blocks", [])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to clear blocks: {}", e)))?;
        for block in blocks {
            Self::insert_block(&tx, block)?;
        }

        // Nothing is visible until commit; a failure above rolls back on drop.
        tx.commit().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to commit transaction: {}", e))
        })?;
        Ok(())
    }

    fn latest_block(&self) -> Result<Option<Block>, ChainError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM blocks ORDER BY block_index DESC LIMIT 1",
                BLOCK_COLUMNS
            ),
            [],
            Self::row_to_block,
        )
        .optional()
        .map_err(|e| ChainError::DatabaseError(format!("Failed to load latest block: {}", e)))
    }

    fn load_blocks(&self) -> Result<Vec<Block>, ChainError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM blocks ORDER BY block_index ASC",
                BLOCK_COLUMNS
            ))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], Self::row_to_block)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query blocks: {}", e)))?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(
                row.map_err(|e| ChainError::DatabaseError(format!("Failed to load block: {}", e)))?,
            );
        }
        Ok(blocks)
    }
}

/// Simple in-memory store useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    blocks: Arc<Mutex<Vec<Block>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Block>>, ChainError> {
        self.blocks
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }
}

impl BlockStore for InMemoryPersistence {
    fn on_block_appended(&self, block: &Block) -> Result<(), ChainError> {
        let mut blocks = self.lock()?;
        blocks.retain(|b| b.index != block.index);
        blocks.push(block.clone());
        blocks.sort_by_key(|b| b.index);
        Ok(())
    }

    fn on_chain_replaced(&self, replacement: &[Block]) -> Result<(), ChainError> {
        let mut blocks = self.lock()?;
        *blocks = replacement.to_vec();
        Ok(())
    }

    fn latest_block(&self) -> Result<Option<Block>, ChainError> {
        Ok(self.lock()?.last().cloned())
    }

    fn load_blocks(&self) -> Result<Vec<Block>, ChainError> {
        Ok(self.lock()?.clone())
    }
}
