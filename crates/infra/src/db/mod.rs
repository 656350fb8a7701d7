//! Primary record store.
//!
//! Every mutation runs inside a [`ProductTransaction`]. Reads that feed a
//! write go through `find_for_update`, which locks the row until commit or
//! rollback. Dropping a transaction without committing rolls it back.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;

use coffeeshop_core::{ProductId, UserId};
use coffeeshop_products::Product;

pub use in_memory::{InMemoryProductStore, InMemoryProductTransaction, InMemoryUserDirectory};
pub use postgres::{PgProductStore, PgProductTransaction, PgUserDirectory};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("record not found")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    type Tx: ProductTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Read outside any transaction.
    async fn get(&self, id: ProductId) -> Result<Option<Product>, StoreError>;
}

#[async_trait]
pub trait ProductTransaction: Send {
    async fn find_for_update(&mut self, id: ProductId) -> Result<Option<Product>, StoreError>;

    /// Fails with [`StoreError::Conflict`] if the name is taken.
    async fn insert(&mut self, product: &Product) -> Result<(), StoreError>;

    /// Fails with [`StoreError::Conflict`] if the new name is taken.
    async fn update(&mut self, product: &Product) -> Result<(), StoreError>;

    async fn delete(&mut self, id: ProductId) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Resolves mail recipients to registered users.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Case-insensitive lookup.
    async fn find_by_email(&self, email: &str) -> Result<Option<UserId>, StoreError>;
}
