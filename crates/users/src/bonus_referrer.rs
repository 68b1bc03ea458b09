use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use modelhooks_core::{Repository, RepositoryError};
use modelhooks_events::{ChangeHandler, FieldChange, HandlerError};

use crate::user::User;

/// Bonus credited to a referrer for each referred user.
pub const FRENS_BONUS: i64 = 10_000;

/// Credits [`FRENS_BONUS`] to the referrer when a user's `referrer` is first set.
pub struct BonusReferrer {
    change: FieldChange<User>,
    users: Arc<dyn Repository<User>>,
}

impl BonusReferrer {
    pub fn new(change: FieldChange<User>, users: Arc<dyn Repository<User>>) -> Self {
        Self { change, users }
    }
}

/// JSON truthiness: null, false, zero and empty values are falsy.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[async_trait]
impl ChangeHandler for BonusReferrer {
    async fn validate(&self) -> bool {
        let user = &self.change.entity;
        !is_truthy(&self.change.old)
            && is_truthy(&self.change.new)
            && user.referrer.is_some_and(|referrer| referrer != user.id)
    }

    async fn execute(&self) -> Result<(), HandlerError> {
        let user = &self.change.entity;
        let Some(referrer_id) = user.referrer else {
            return Ok(());
        };

        let mut referrer = self
            .users
            .get(referrer_id)
            .await?
            .ok_or(RepositoryError::NotFound {
                entity_type: "users",
                id: referrer_id,
            })?;

        if !referrer.credit_referral(user.id, FRENS_BONUS)? {
            info!(
                referrer_id = %referrer_id,
                user_id = %user.id,
                event_id = %self.change.event_id,
                "referral already credited"
            );
            return Ok(());
        }

        self.users.save(&mut referrer).await?;
        info!(
            referrer_id = %referrer_id,
            user_id = %user.id,
            bonus = FRENS_BONUS,
            "referral bonus credited"
        );
        Ok(())
    }
}
