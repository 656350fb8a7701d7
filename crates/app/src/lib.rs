//! Process wiring for the coffee-shop worker.
//!
//! `Services::init` builds every shared resource once: the Postgres pool,
//! the S3 and SMTP gateways, the queue backend, the task processor and the
//! product coordinator. `Services::shutdown` drains the processor and closes
//! the pool.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use coffeeshop_infra::config::AppConfig;
use coffeeshop_infra::coordinator::ProductCoordinator;
use coffeeshop_infra::db::{PgProductStore, PgUserDirectory};
use coffeeshop_infra::external::mail::SmtpMailer;
use coffeeshop_infra::external::object_store::S3ObjectStore;
use coffeeshop_infra::tasks::{
    PgQueueBackend, ProcessorHandle, ProcessorStats, TaskDistributor, TaskProcessor,
    standard_registry,
};

pub type Coordinator = ProductCoordinator<PgProductStore, PgQueueBackend>;

pub struct Services {
    pool: PgPool,
    processor: ProcessorHandle,
    distributor: TaskDistributor<PgQueueBackend>,
    coordinator: Coordinator,
}

impl Services {
    pub async fn init(config: AppConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.url)
            .await
            .context("failed to connect to Postgres")?;

        let products = PgProductStore::new(pool.clone());
        products
            .ensure_schema()
            .await
            .context("failed to prepare product schema")?;
        let backend = PgQueueBackend::new(pool.clone());
        backend
            .ensure_schema()
            .await
            .context("failed to prepare task schema")?;

        let objects = S3ObjectStore::connect(&config.object_store).await;
        let mailer = SmtpMailer::new(&config.mail).context("failed to build SMTP transport")?;

        let registry = standard_registry(
            Arc::new(objects),
            Arc::new(PgUserDirectory::new(pool.clone())),
            Arc::new(mailer),
            config.mail.links.clone(),
        );
        let processor = TaskProcessor::new(backend.clone(), registry, config.processor.clone())
            .context("invalid task processor setup")?
            .spawn();

        let coordinator = ProductCoordinator::new(products, TaskDistributor::new(backend.clone()))
            .with_policy(config.mutation.clone());

        tracing::info!(
            bucket = %config.object_store.bucket,
            region = %config.object_store.region,
            smtp_host = %config.mail.smtp_host,
            concurrency = config.processor.concurrency,
            "services initialized"
        );

        Ok(Self {
            pool,
            processor,
            distributor: TaskDistributor::new(backend),
            coordinator,
        })
    }

    /// Product create/update/delete entry point for the request layer.
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Enqueue entry point for mail and ad-hoc tasks.
    pub fn distributor(&self) -> &TaskDistributor<PgQueueBackend> {
        &self.distributor
    }

    pub fn processor_stats(&self) -> ProcessorStats {
        self.processor.stats()
    }

    pub async fn shutdown(self) -> ProcessorStats {
        let stats = self.processor.shutdown().await;
        self.pool.close().await;
        stats
    }
}
