use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use modelhooks_core::{DomainError, DomainResult, Entity, EntityId};

/// A user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    /// The user who referred this one.
    #[serde(default)]
    pub referrer: Option<EntityId>,
    #[serde(default)]
    pub balance: i64,
    /// Referred users this user has already been credited for.
    #[serde(default)]
    pub credited_referrals: BTreeSet<EntityId>,
    #[serde(default)]
    pub updated: Option<i64>,
}

impl User {
    pub fn new(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            referrer: None,
            balance: 0,
            credited_referrals: BTreeSet::new(),
            updated: None,
        }
    }

    pub fn with_referrer(mut self, referrer: EntityId) -> Self {
        self.referrer = Some(referrer);
        self
    }

    /// Credit `amount` for bringing in `referral`, once per referral.
    ///
    /// Returns `Ok(false)` if `referral` was already credited.
    pub fn credit_referral(&mut self, referral: EntityId, amount: i64) -> DomainResult<bool> {
        if referral == self.id {
            return Err(DomainError::rejected(format!("user {} cannot refer themselves", self.id)));
        }
        if self.credited_referrals.contains(&referral) {
            return Ok(false);
        }
        self.balance = self.balance.checked_add(amount).ok_or_else(|| {
            DomainError::rejected(format!("crediting {amount} overflows the balance of user {}", self.id))
        })?;
        self.credited_referrals.insert(referral);
        Ok(true)
    }
}

impl Entity for User {
    const ENTITY_TYPE: &'static str = "users";

    fn id(&self) -> EntityId {
        self.id
    }

    fn updated(&self) -> Option<i64> {
        self.updated
    }

    fn touch(&mut self, at: i64) {
        self.updated = Some(at);
    }
}
