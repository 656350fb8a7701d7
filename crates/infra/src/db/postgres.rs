//! Postgres-backed product store and user directory.
//!
//! `products.name` carries a unique index; a `23505` raised by insert or
//! update surfaces as [`StoreError::Conflict`]. `find_for_update` issues
//! `SELECT … FOR UPDATE`, so concurrent mutations of one product serialize on
//! the row lock.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use coffeeshop_core::{ProductId, UserId};
use coffeeshop_products::Product;

use super::{ProductStore, ProductTransaction, StoreError, UserDirectory};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS products (
        id          UUID PRIMARY KEY,
        name        TEXT NOT NULL,
        price       DOUBLE PRECISION NOT NULL,
        discount    INTEGER NOT NULL DEFAULT 0,
        summary     TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        category    TEXT NOT NULL,
        ingredients TEXT[] NOT NULL DEFAULT '{}',
        images      TEXT[] NOT NULL DEFAULT '{}',
        thumbnail   TEXT NOT NULL DEFAULT '',
        ratings     DOUBLE PRECISION NOT NULL DEFAULT 0,
        author      UUID,
        created_at  TIMESTAMPTZ NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS products_name_key ON products (name)",
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id    UUID PRIMARY KEY,
        email TEXT NOT NULL UNIQUE
    )
    "#,
];

const COLUMNS: &str = "id, name, price, discount, summary, description, category, \
     ingredients, images, thumbnail, ratings, author, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgProductStore {
    pool: Arc<PgPool>,
}

impl PgProductStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `products` and `users` tables if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProductStore for PgProductStore {
    type Tx = PgProductTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PgProductTransaction { tx })
    }

    async fn get(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM products WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(product_from_row).transpose()
    }
}

pub struct PgProductTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ProductTransaction for PgProductTransaction {
    #[instrument(skip(self), fields(product_id = %id), err)]
    async fn find_for_update(&mut self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM products WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_for_update", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    #[instrument(skip(self, product), fields(product_id = %product.id), err)]
    async fn insert(&mut self, product: &Product) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO products (
                id, name, price, discount, summary, description, category,
                ingredients, images, thumbnail, ratings, author, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(product.id.as_uuid())
        .bind(&product.name)
        .bind(product.price)
        .bind(product.discount as i32)
        .bind(&product.summary)
        .bind(&product.description)
        .bind(&product.category)
        .bind(&product.ingredients)
        .bind(&product.images)
        .bind(&product.thumbnail)
        .bind(product.ratings)
        .bind(product.author.map(Uuid::from))
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_product", e))?;
        Ok(())
    }

    #[instrument(skip(self, product), fields(product_id = %product.id), err)]
    async fn update(&mut self, product: &Product) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE products
            SET name = $2, price = $3, discount = $4, summary = $5, description = $6,
                category = $7, ingredients = $8, images = $9, thumbnail = $10,
                ratings = $11, updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(product.id.as_uuid())
        .bind(&product.name)
        .bind(product.price)
        .bind(product.discount as i32)
        .bind(&product.summary)
        .bind(&product.description)
        .bind(&product.category)
        .bind(&product.ingredients)
        .bind(&product.images)
        .bind(&product.thumbnail)
        .bind(product.ratings)
        .bind(product.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_product", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(product_id = %id), err)]
    async fn delete(&mut self, id: ProductId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_product", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[derive(Debug, Clone)]
pub struct PgUserDirectory {
    pool: Arc<PgPool>,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserId>, StoreError> {
        let row = sqlx::query("SELECT id FROM users WHERE lower(email) = lower($1)")
            .bind(email.trim())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_user_by_email", e))?;

        row.map(|r| r.try_get::<Uuid, _>("id").map(UserId::from))
            .transpose()
            .map_err(column_error)
    }
}

fn product_from_row(row: &PgRow) -> Result<Product, StoreError> {
    let id: Uuid = row.try_get("id").map_err(column_error)?;
    let discount: i32 = row.try_get("discount").map_err(column_error)?;
    let author: Option<Uuid> = row.try_get("author").map_err(column_error)?;

    Ok(Product {
        id: ProductId::from_uuid(id),
        name: row.try_get("name").map_err(column_error)?,
        price: row.try_get("price").map_err(column_error)?,
        discount: discount.max(0) as u32,
        summary: row.try_get("summary").map_err(column_error)?,
        description: row.try_get("description").map_err(column_error)?,
        category: row.try_get("category").map_err(column_error)?,
        ingredients: row.try_get("ingredients").map_err(column_error)?,
        images: row.try_get("images").map_err(column_error)?,
        thumbnail: row.try_get("thumbnail").map_err(column_error)?,
        ratings: row.try_get("ratings").map_err(column_error)?,
        author: author.map(UserId::from_uuid),
        created_at: row.try_get("created_at").map_err(column_error)?,
        updated_at: row.try_get("updated_at").map_err(column_error)?,
    })
}

fn column_error(err: sqlx::Error) -> StoreError {
    StoreError::Storage(format!("failed to read row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
