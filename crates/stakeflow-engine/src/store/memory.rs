//! In-memory ledger store
//!
//! Uses DashMap for concurrent access. Account updates hold the record's
//! shard lock for the whole read-modify-write, which serializes concurrent
//! credits to the same wallet. Lock order is always rewards → users →
//! stakes.

use super::{AccountChange, LedgerStore, RewardEntry, Settlement, StoreError, UserMutation};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use stakeflow_common::{Stake, UserAccount};
use uuid::Uuid;

/// In-memory storage implementation
#[derive(Default)]
pub struct InMemoryLedgerStore {
    /// All stakes by ID
    stakes: DashMap<Uuid, Stake>,

    /// Accounts by user ID
    users: DashMap<String, UserAccount>,

    /// Reward ledger, one entry per settled stake
    rewards: DashMap<Uuid, RewardEntry>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reward ledger entry for a stake, if settled
    pub fn reward_entry(&self, stake_id: &Uuid) -> Option<RewardEntry> {
        self.rewards.get(stake_id).map(|e| e.clone())
    }

    /// Number of settled rewards
    pub fn reward_count(&self) -> usize {
        self.rewards.len()
    }

    /// Number of stakes of any status
    pub fn stake_count(&self) -> usize {
        self.stakes.len()
    }

    /// Apply a mutation to a copy of the account and commit it only on
    /// success. The caller must hold no lock on `users`.
    fn apply(&self, user_id: &str, mutation: &UserMutation<'_>) -> Result<AccountChange, StoreError> {
        let mut entry = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;

        let before = entry.clone();
        let mut after = before.clone();
        mutation(&mut after)?;
        after.version = before.version + 1;
        *entry = after.clone();

        Ok(AccountChange { before, after })
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn load_active_stakes(&self) -> Result<Vec<Stake>, StoreError> {
        Ok(self
            .stakes
            .iter()
            .filter(|s| s.is_pending())
            .map(|s| s.clone())
            .collect())
    }

    async fn load_stake(&self, id: &Uuid) -> Result<Option<Stake>, StoreError> {
        Ok(self.stakes.get(id).map(|s| s.clone()))
    }

    async fn save_stake(&self, stake: &Stake) -> Result<(), StoreError> {
        let mut existing = self
            .stakes
            .get_mut(&stake.id)
            .ok_or_else(|| StoreError::NotFound(format!("stake {}", stake.id)))?;

        if existing.version != stake.version {
            return Err(StoreError::StaleStake {
                id: stake.id,
                expected: stake.version,
            });
        }
        let mut next = stake.clone();
        next.version = stake.version + 1;
        *existing = next;
        Ok(())
    }

    async fn create_stake(&self, stake: &Stake) -> Result<AccountChange, StoreError> {
        let mut owner = self
            .users
            .get_mut(&stake.owner_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", stake.owner_id)))?;

        let before = owner.clone();
        let mut after = before.clone();
        after.debit(stake.principal)?;
        after.version = before.version + 1;

        match self.stakes.entry(stake.id) {
            Entry::Occupied(_) => return Err(StoreError::DuplicateStake(stake.id)),
            Entry::Vacant(slot) => {
                slot.insert(stake.clone());
            }
        }
        *owner = after.clone();

        Ok(AccountChange { before, after })
    }

    async fn load_user(&self, user_id: &str) -> Result<Option<UserAccount>, StoreError> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }

    async fn insert_user(&self, user: &UserAccount) -> Result<(), StoreError> {
        match self.users.entry(user.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateUser(user.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(user.clone());
                Ok(())
            }
        }
    }

    async fn update_user(
        &self,
        user_id: &str,
        mutation: &UserMutation<'_>,
    ) -> Result<AccountChange, StoreError> {
        self.apply(user_id, mutation)
    }

    async fn settle_reward(
        &self,
        stake_id: &Uuid,
        owner_id: &str,
        amount: Decimal,
    ) -> Result<Settlement, StoreError> {
        match self.rewards.entry(*stake_id) {
            Entry::Occupied(existing) => Ok(Settlement::AlreadySettled(existing.get().clone())),
            Entry::Vacant(slot) => {
                let change = self.apply(owner_id, &move |account: &mut UserAccount| {
                    account.credit(amount)
                })?;
                slot.insert(RewardEntry::new(*stake_id, owner_id, amount));
                Ok(Settlement::Credited(change))
            }
        }
    }
}
