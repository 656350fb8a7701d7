//! Transactional product mutations.
//!
//! Each operation runs in one database transaction:
//!
//! ```text
//! begin
//!   ↓
//! read (row-locked) / validate / write the product
//!   ↓
//! enqueue the side effects collected along the way
//!   ↓
//! commit
//! ```
//!
//! Side effects are collected in order while the transaction runs and are
//! enqueued only after every validation and write has succeeded, right
//! before commit. A validation failure, a name conflict or a missing record
//! therefore enqueues nothing.
//!
//! The queue and the database are separate systems. If the commit itself
//! fails after the enqueue, the tasks stay queued. The handlers tolerate
//! this: uploads of orphaned keys are harmless and deletes of absent keys
//! succeed.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};

use coffeeshop_core::{DomainError, DomainResult, ProductId, UserId};
use coffeeshop_products::{
    PreparedImage, Product, ProductFields, ProductPatch, prepare_gallery_image, prepare_thumbnail,
};

use crate::db::{ProductStore, ProductTransaction, StoreError};
use crate::tasks::{
    DistributeError, EnqueueOptions, QueueBackend, QueueClass, TaskDistributor, TaskId,
    TaskPayload, UploadImage,
};

/// Enqueue options per kind of side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationPolicy {
    /// Thumbnail and gallery uploads.
    pub upload: EnqueueOptions,
    /// Removal of a thumbnail that was just replaced.
    pub stale_thumbnail_delete: EnqueueOptions,
    /// Removal of every object of a deleted product.
    pub product_cleanup: EnqueueOptions,
}

impl Default for MutationPolicy {
    fn default() -> Self {
        let critical = EnqueueOptions::default()
            .queue(QueueClass::Critical)
            .max_retry(3);
        Self {
            upload: critical.process_in(Duration::from_secs(2)),
            stale_thumbnail_delete: critical.process_in(Duration::from_secs(180)),
            product_cleanup: critical.process_in(Duration::from_secs(60)),
        }
    }
}

impl MutationPolicy {
    /// Same classes and retry limits, no delays.
    pub fn immediate() -> Self {
        let policy = Self::default();
        Self {
            upload: policy.upload.process_in(Duration::ZERO),
            stale_thumbnail_delete: policy.stale_thumbnail_delete.process_in(Duration::ZERO),
            product_cleanup: policy.product_cleanup.process_in(Duration::ZERO),
        }
    }
}

/// Raw image uploads accompanying a mutation.
#[derive(Debug, Clone, Default)]
pub struct ProductBlobs {
    pub thumbnail: Option<Vec<u8>>,
    /// Gallery images, appended to the product's existing ones.
    pub images: Vec<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("product not found")]
    NotFound,
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("failed to enqueue side effect: {0}")]
    Enqueue(#[from] DistributeError),
}

impl CoordinatorError {
    /// HTTP status the request layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            CoordinatorError::Validation(_) => 400,
            CoordinatorError::Conflict(_) => 409,
            CoordinatorError::NotFound => 404,
            CoordinatorError::Store(_) | CoordinatorError::Enqueue(_) => 500,
        }
    }
}

impl From<DomainError> for CoordinatorError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                CoordinatorError::Validation(msg)
            }
            DomainError::InvariantViolation(msg) => CoordinatorError::Validation(msg),
            DomainError::Conflict(msg) => CoordinatorError::Conflict(msg),
            DomainError::NotFound => CoordinatorError::NotFound,
        }
    }
}

impl From<StoreError> for CoordinatorError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(msg) => CoordinatorError::Conflict(msg),
            StoreError::NotFound => CoordinatorError::NotFound,
            other => CoordinatorError::Store(other),
        }
    }
}

/// Ordered side effects waiting for the transaction to reach commit.
#[derive(Debug, Default)]
struct PendingSideEffects {
    effects: Vec<(TaskPayload, EnqueueOptions)>,
}

impl PendingSideEffects {
    fn upload(&mut self, image: PreparedImage, opts: EnqueueOptions) {
        self.effects
            .push((TaskPayload::UploadImage(image.into()), opts));
    }

    fn upload_batch(&mut self, images: Vec<PreparedImage>, opts: EnqueueOptions) {
        if images.is_empty() {
            return;
        }
        let images = images.into_iter().map(UploadImage::from).collect();
        self.effects.push((TaskPayload::UploadImageBatch(images), opts));
    }

    fn delete(&mut self, keys: Vec<String>, opts: EnqueueOptions) {
        let keys: Vec<String> = keys.into_iter().filter(|k| !k.is_empty()).collect();
        if keys.is_empty() {
            return;
        }
        self.effects.push((TaskPayload::DeleteObjects(keys), opts));
    }

    async fn flush<B: QueueBackend>(
        self,
        distributor: &TaskDistributor<B>,
    ) -> Result<Vec<TaskId>, DistributeError> {
        let mut ids = Vec::with_capacity(self.effects.len());
        for (payload, opts) in &self.effects {
            ids.push(distributor.enqueue(payload, *opts).await?);
        }
        Ok(ids)
    }
}

struct Staged {
    product: Product,
    effects: PendingSideEffects,
}

/// Runs product create/update/delete and schedules their storage side effects.
pub struct ProductCoordinator<S, B> {
    store: S,
    distributor: TaskDistributor<B>,
    policy: MutationPolicy,
}

impl<S: ProductStore, B: QueueBackend> ProductCoordinator<S, B> {
    pub fn new(store: S, distributor: TaskDistributor<B>) -> Self {
        Self {
            store,
            distributor,
            policy: MutationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: MutationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn distributor(&self) -> &TaskDistributor<B> {
        &self.distributor
    }

    /// Validate and insert a new product, scheduling uploads of its images.
    #[instrument(skip(self, fields, blobs), fields(name = %fields.name), err)]
    pub async fn create(
        &self,
        fields: ProductFields,
        author: Option<UserId>,
        blobs: ProductBlobs,
    ) -> Result<Product, CoordinatorError> {
        let mut product = Product::create(ProductId::new(), fields, author, Utc::now())?;
        let mut effects = PendingSideEffects::default();
        self.attach_blobs(&mut product, blobs, &mut effects)?;

        let mut tx = self.store.begin().await?;
        if let Err(e) = tx.insert(&product).await {
            return Err(rollback(tx, e.into()).await);
        }
        let tasks = self.commit(tx, effects).await?;

        info!(product_id = %product.id, tasks = tasks.len(), "product created");
        Ok(product)
    }

    /// Apply a partial update. A new thumbnail replaces the old one, which is
    /// deleted after a delay; new gallery images are appended.
    #[instrument(skip(self, patch, blobs), fields(product_id = %id), err)]
    pub async fn update(
        &self,
        id: ProductId,
        patch: ProductPatch,
        blobs: ProductBlobs,
    ) -> Result<Product, CoordinatorError> {
        let mut tx = self.store.begin().await?;
        let staged = match self.stage_update(&mut tx, id, patch, blobs).await {
            Ok(staged) => staged,
            Err(e) => return Err(rollback(tx, e).await),
        };
        let tasks = self.commit(tx, staged.effects).await?;

        info!(product_id = %id, tasks = tasks.len(), "product updated");
        Ok(staged.product)
    }

    /// Remove a product and schedule deletion of all its objects.
    #[instrument(skip(self), fields(product_id = %id), err)]
    pub async fn delete(&self, id: ProductId) -> Result<Product, CoordinatorError> {
        let mut tx = self.store.begin().await?;
        let staged = match self.stage_delete(&mut tx, id).await {
            Ok(staged) => staged,
            Err(e) => return Err(rollback(tx, e).await),
        };
        let tasks = self.commit(tx, staged.effects).await?;

        info!(product_id = %id, tasks = tasks.len(), "product deleted");
        Ok(staged.product)
    }

    async fn stage_update(
        &self,
        tx: &mut S::Tx,
        id: ProductId,
        patch: ProductPatch,
        blobs: ProductBlobs,
    ) -> Result<Staged, CoordinatorError> {
        let mut product = tx
            .find_for_update(id)
            .await?
            .ok_or(CoordinatorError::NotFound)?;

        product.apply_patch(patch, Utc::now())?;
        let mut effects = PendingSideEffects::default();
        self.attach_blobs(&mut product, blobs, &mut effects)?;

        tx.update(&product).await?;
        Ok(Staged { product, effects })
    }

    async fn stage_delete(&self, tx: &mut S::Tx, id: ProductId) -> Result<Staged, CoordinatorError> {
        let product = tx
            .find_for_update(id)
            .await?
            .ok_or(CoordinatorError::NotFound)?;

        let mut effects = PendingSideEffects::default();
        effects.delete(product.object_keys(), self.policy.product_cleanup);

        tx.delete(id).await?;
        Ok(Staged { product, effects })
    }

    /// Sniff and key the blobs, point the record at them and queue the
    /// uploads. A replaced thumbnail is queued for deletion first.
    fn attach_blobs(
        &self,
        product: &mut Product,
        blobs: ProductBlobs,
        effects: &mut PendingSideEffects,
    ) -> DomainResult<()> {
        let thumbnail = blobs.thumbnail.map(prepare_thumbnail).transpose()?;
        let gallery = blobs
            .images
            .into_iter()
            .map(|bytes| prepare_gallery_image(&product.category, bytes))
            .collect::<DomainResult<Vec<_>>>()?;

        if let Some(image) = thumbnail {
            if let Some(stale) = product.replace_thumbnail(image.object_key.clone()) {
                effects.delete(vec![stale], self.policy.stale_thumbnail_delete);
            }
            effects.upload(image, self.policy.upload);
        }

        product.add_images(gallery.iter().map(|i| i.object_key.clone()));
        effects.upload_batch(gallery, self.policy.upload);
        Ok(())
    }

    async fn commit(
        &self,
        tx: S::Tx,
        effects: PendingSideEffects,
    ) -> Result<Vec<TaskId>, CoordinatorError> {
        let tasks = match effects.flush(&self.distributor).await {
            Ok(tasks) => tasks,
            Err(e) => return Err(rollback(tx, e.into()).await),
        };
        if let Err(e) = tx.commit().await {
            warn!(
                error = %e,
                enqueued = tasks.len(),
                "commit failed after side effects were enqueued"
            );
            return Err(e.into());
        }
        Ok(tasks)
    }
}

async fn rollback<T: ProductTransaction>(tx: T, err: CoordinatorError) -> CoordinatorError {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "rollback failed");
    }
    err
}
