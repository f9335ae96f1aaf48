//! Read-only collaborator lookups
//!
//! The surrounding platform owns users, referrals, the catalog, and the
//! founder allowlist; the orchestrator only queries them. The trait keeps
//! those lookups behind a seam so the resolvers are testable with fakes,
//! the same way the processor gateway and dropship provider are.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::FulfillmentResult;

#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolve an internal user id from a customer email.
    async fn user_id_by_email(&self, email: &str) -> FulfillmentResult<Option<Uuid>>;

    /// Resolve a user's email from their id.
    async fn user_email_by_id(&self, user_id: Uuid) -> FulfillmentResult<Option<String>>;

    /// The active referrer for a referred user, if any.
    async fn active_referrer_for(
        &self,
        referred_user_id: Uuid,
    ) -> FulfillmentResult<Option<Uuid>>;

    /// The lifetime-access type on the allowlist for this email, if any.
    async fn founder_access_type(&self, email: &str) -> FulfillmentResult<Option<String>>;

    /// Ids of the files deliverable for a digital product.
    async fn product_file_ids(&self, product_id: &str) -> FulfillmentResult<Vec<Uuid>>;
}

/// Production lookups against the platform database.
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn user_id_by_email(&self, email: &str) -> FulfillmentResult<Option<Uuid>> {
        let id = sqlx::query_scalar("SELECT id FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn user_email_by_id(&self, user_id: Uuid) -> FulfillmentResult<Option<String>> {
        let email = sqlx::query_scalar("SELECT email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(email)
    }

    async fn active_referrer_for(
        &self,
        referred_user_id: Uuid,
    ) -> FulfillmentResult<Option<Uuid>> {
        let id = sqlx::query_scalar(
            "SELECT referrer_id FROM referrals WHERE referred_user_id = $1 AND status = 'active'",
        )
        .bind(referred_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn founder_access_type(&self, email: &str) -> FulfillmentResult<Option<String>> {
        let access_type =
            sqlx::query_scalar("SELECT access_type FROM lifetime_access WHERE email = $1")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        Ok(access_type)
    }

    async fn product_file_ids(&self, product_id: &str) -> FulfillmentResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar("SELECT id FROM product_files WHERE product_id = $1")
            .bind(product_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}
