use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use coffeeshop_core::{ProductId, UserId};
use coffeeshop_products::Product;

use super::{ProductStore, ProductTransaction, StoreError, UserDirectory};

type Rows = HashMap<ProductId, Product>;

/// In-memory product table. Transactions are serialized: `begin` waits
/// until the previous transaction has finished.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProductStore {
    rows: Arc<Mutex<Rows>>,
    failing_commits: Arc<AtomicUsize>,
}

impl InMemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail (the transaction is rolled back).
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    pub async fn all(&self) -> Vec<Product> {
        let mut all: Vec<_> = self.rows.lock().await.values().cloned().collect();
        all.sort_by_key(|p| p.id);
        all
    }
}

#[async_trait]
impl ProductStore for InMemoryProductStore {
    type Tx = InMemoryProductTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let guard = self.rows.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(InMemoryProductTransaction {
            guard,
            staged,
            failing_commits: self.failing_commits.clone(),
        })
    }

    async fn get(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }
}

/// Works on a staged copy; `commit` swaps it in.
pub struct InMemoryProductTransaction {
    guard: OwnedMutexGuard<Rows>,
    staged: Rows,
    failing_commits: Arc<AtomicUsize>,
}

impl InMemoryProductTransaction {
    fn ensure_unique_name(&self, product: &Product) -> Result<(), StoreError> {
        let taken = self
            .staged
            .values()
            .any(|p| p.id != product.id && p.name == product.name);
        if taken {
            return Err(StoreError::Conflict(format!(
                "product name '{}' already exists",
                product.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProductTransaction for InMemoryProductTransaction {
    async fn find_for_update(&mut self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.staged.get(&id).cloned())
    }

    async fn insert(&mut self, product: &Product) -> Result<(), StoreError> {
        if self.staged.contains_key(&product.id) {
            return Err(StoreError::Conflict(format!("product {} already exists", product.id)));
        }
        self.ensure_unique_name(product)?;
        self.staged.insert(product.id, product.clone());
        Ok(())
    }

    async fn update(&mut self, product: &Product) -> Result<(), StoreError> {
        if !self.staged.contains_key(&product.id) {
            return Err(StoreError::NotFound);
        }
        self.ensure_unique_name(product)?;
        self.staged.insert(product.id, product.clone());
        Ok(())
    }

    async fn delete(&mut self, id: ProductId) -> Result<(), StoreError> {
        self.staged.remove(&id).map(|_| ()).ok_or(StoreError::NotFound)
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Storage("injected commit failure".to_string()));
        }
        *self.guard = std::mem::take(&mut self.staged);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Email → user id map for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<String, UserId>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `email` and return its new id.
    pub fn register(&self, email: &str) -> UserId {
        let id = UserId::new();
        if let Ok(mut users) = self.users.write() {
            users.insert(email.trim().to_lowercase(), id);
        }
        id
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserId>, StoreError> {
        let users = self
            .users
            .read()
            .map_err(|_| StoreError::Storage("user map lock poisoned".to_string()))?;
        Ok(users.get(&email.trim().to_lowercase()).copied())
    }
}
