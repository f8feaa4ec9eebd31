use std::sync::{Arc, Mutex};

use chrono::Utc;
use emberline_common::Result;
use emberline_config::{LimitKind, ModelRegistry};
use emberline_db::{ChatStore, QuotaRow};
use tracing::debug;

/// Daily consumption accounting per user and model.
///
/// Counters live in the store and are written through on every consume; the
/// day rolls over lazily on first access after midnight UTC. The configured
/// owner identity and anyone on the bypass list are never throttled, and a
/// denial never consumes anything.
pub struct QuotaLedger {
    store: Arc<Mutex<ChatStore>>,
    registry: Arc<ModelRegistry>,
    owner_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed,
    Denied { reason: String },
}

#[derive(Debug, Clone)]
pub struct QuotaStatus {
    pub characters_used: u64,
    pub images_used: u64,
    pub bypassed: bool,
}

impl QuotaLedger {
    pub fn new(
        store: Arc<Mutex<ChatStore>>,
        registry: Arc<ModelRegistry>,
        owner_user_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            owner_user_id: owner_user_id.into(),
        }
    }

    pub fn check(&self, user_id: &str, model_id: &str, amount: u64) -> Result<QuotaDecision> {
        let Some(descriptor) = self.registry.get(model_id) else {
            // Unknown models are rejected before accounting ever runs.
            return Ok(QuotaDecision::Allowed);
        };

        let store = self.store.lock().expect("store lock poisoned");
        if self.is_exempt(&store, user_id)? {
            return Ok(QuotaDecision::Allowed);
        }

        let Some(limit) = store.limit_override(model_id)?.or(descriptor.daily_limit) else {
            return Ok(QuotaDecision::Allowed);
        };

        let row = current_row(&store, user_id)?;
        let decision = match descriptor.limit_kind {
            LimitKind::Characters => {
                if row.characters_used + amount > limit {
                    let remaining = limit.saturating_sub(row.characters_used);
                    QuotaDecision::Denied {
                        reason: format!(
                            "daily limit for {} reached ({limit} chars/day, {remaining} left, resets at midnight UTC)",
                            descriptor.display_name
                        ),
                    }
                } else {
                    QuotaDecision::Allowed
                }
            }
            LimitKind::Items => {
                if row.images_used >= limit {
                    QuotaDecision::Denied {
                        reason: format!(
                            "daily image limit reached ({limit}/day, resets at midnight UTC)"
                        ),
                    }
                } else {
                    QuotaDecision::Allowed
                }
            }
        };
        Ok(decision)
    }

    pub fn consume(&self, user_id: &str, model_id: &str, amount: u64) -> Result<()> {
        let Some(descriptor) = self.registry.get(model_id) else {
            return Ok(());
        };

        let store = self.store.lock().expect("store lock poisoned");
        if self.is_exempt(&store, user_id)? {
            return Ok(());
        }

        let mut row = current_row(&store, user_id)?;
        match descriptor.limit_kind {
            LimitKind::Characters => row.characters_used += amount,
            LimitKind::Items => row.images_used += amount,
        }
        debug!(
            user = user_id,
            model = model_id,
            characters = row.characters_used,
            images = row.images_used,
            "quota consumed"
        );
        store.put_quota_row(&row)
    }

    pub fn status(&self, user_id: &str) -> Result<QuotaStatus> {
        let store = self.store.lock().expect("store lock poisoned");
        let row = current_row(&store, user_id)?;
        Ok(QuotaStatus {
            characters_used: row.characters_used,
            images_used: row.images_used,
            bypassed: self.is_exempt(&store, user_id)?,
        })
    }

    fn is_exempt(&self, store: &ChatStore, user_id: &str) -> Result<bool> {
        if !self.owner_user_id.is_empty() && user_id == self.owner_user_id {
            return Ok(true);
        }
        store.is_bypassed(user_id)
    }
}

/// Load the user's quota row, rebasing it when the stored date is stale.
fn current_row(store: &ChatStore, user_id: &str) -> Result<QuotaRow> {
    let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
    match store.quota_row(user_id)? {
        Some(row) if row.reset_date == today => Ok(row),
        _ => Ok(QuotaRow::fresh(user_id, today)),
    }
}
