//! Download grant issuance
//!
//! Mints single-purpose access tokens for purchased digital goods: 256 bits
//! of OS randomness rendered as opaque fixed-length hex, a fixed expiry
//! window, and a use cap. One grant per (order, product), enforced by the
//! ledger. A product with no associated files is a catalog condition, not a
//! processing failure.

use std::sync::Arc;

use rand::RngCore;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::audit::{ActionLogBuilder, ActionLogger, ActionType};
use crate::directory::{Directory, PgDirectory};
use crate::error::FulfillmentResult;
use crate::gateway::LineItem;
use crate::ledger::{EffectLedger, IdempotencyLedger, LedgerOutcome, NewDownloadGrant};

/// Days until a grant expires.
pub const GRANT_VALID_DAYS: i64 = 7;
/// Downloads allowed per grant.
pub const GRANT_MAX_USES: i32 = 5;
/// Underlying token entropy in bytes (256 bits).
pub const TOKEN_BYTES: usize = 32;

/// Generate an opaque download token: 32 random bytes, hex-rendered to a
/// fixed 64-character string with no predictable structure.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A freshly issued grant, aggregated into the confirmation notification.
#[derive(Debug, Clone)]
pub struct IssuedGrant {
    pub product_id: String,
    pub product_name: String,
    pub token: String,
    pub expires_at: OffsetDateTime,
}

pub struct DownloadGrantIssuer {
    directory: Arc<dyn Directory>,
    ledger: Arc<dyn EffectLedger>,
    audit: ActionLogger,
}

impl DownloadGrantIssuer {
    pub fn new(pool: PgPool) -> Self {
        Self::with_parts(
            Arc::new(PgDirectory::new(pool.clone())),
            Arc::new(IdempotencyLedger::new(pool.clone())),
            ActionLogger::new(pool),
        )
    }

    pub fn with_parts(
        directory: Arc<dyn Directory>,
        ledger: Arc<dyn EffectLedger>,
        audit: ActionLogger,
    ) -> Self {
        Self {
            directory,
            ledger,
            audit,
        }
    }

    /// Issue a grant for one purchased digital product. Returns `None` when
    /// the product has no deliverable files or the grant already exists.
    pub async fn issue(
        &self,
        order_id: &str,
        user_id: Option<Uuid>,
        item: &LineItem,
    ) -> FulfillmentResult<Option<IssuedGrant>> {
        let file_ids = self.directory.product_file_ids(&item.product_id).await?;

        if file_ids.is_empty() {
            self.audit
                .log(
                    ActionLogBuilder::new(order_id, ActionType::DownloadGrantSkipped).metadata(
                        serde_json::json!({
                            "product_id": item.product_id,
                            "reason": "no_associated_files",
                        }),
                    ),
                )
                .await;
            tracing::info!(
                order_id = order_id,
                product_id = %item.product_id,
                "Digital product has no files, no grant issued"
            );
            return Ok(None);
        }

        let token = generate_token();
        let expires_at = OffsetDateTime::now_utc() + Duration::days(GRANT_VALID_DAYS);

        let grant = NewDownloadGrant {
            order_id: order_id.to_string(),
            user_id,
            product_id: item.product_id.clone(),
            token: token.clone(),
            file_ids: file_ids.clone(),
            expires_at,
            max_uses: GRANT_MAX_USES,
        };

        match self.ledger.insert_download_grant(&grant).await? {
            LedgerOutcome::Created(grant_id) => {
                self.audit
                    .log(
                        ActionLogBuilder::new(order_id, ActionType::DownloadGrantCreated)
                            .metadata(serde_json::json!({
                                "grant_id": grant_id,
                                "product_id": item.product_id,
                                "file_count": file_ids.len(),
                                "expires_at": expires_at.unix_timestamp(),
                            })),
                    )
                    .await;

                tracing::info!(
                    order_id = order_id,
                    product_id = %item.product_id,
                    grant_id = %grant_id,
                    "Download grant issued"
                );

                Ok(Some(IssuedGrant {
                    product_id: item.product_id.clone(),
                    product_name: item.product_name.clone(),
                    token,
                    expires_at,
                }))
            }
            LedgerOutcome::AlreadyRecorded => {
                tracing::info!(
                    order_id = order_id,
                    product_id = %item.product_id,
                    "Download grant already exists for this order and product, no-op"
                );
                Ok(None)
            }
        }
    }
}
