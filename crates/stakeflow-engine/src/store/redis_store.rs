//! Redis ledger store
//!
//! Layout under a configurable prefix:
//! - `{prefix}:user:{id}`: hash with `doc` (JSON account) and `version`
//! - `{prefix}:stake:{id}`: JSON stake, carrying its own `version`
//! - `{prefix}:stakes:pending`: set of stake IDs still needing a sweep
//! - `{prefix}:reward:{stake_id}`: JSON reward ledger entry
//!
//! Account updates are optimistic: read the document, apply the mutation
//! locally with exact decimal arithmetic, then commit through a Lua script
//! that only writes if `version` is unchanged. Conflicts are retried.
//! Stake writes use the same check but are not retried here: a stale stake
//! has to be re-advanced by the caller.

use super::{AccountChange, LedgerStore, RewardEntry, Settlement, StoreError, UserMutation};
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client, Script};
use rust_decimal::Decimal;
use stakeflow_common::{Stake, UserAccount};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

/// Default attempts for a contended compare-and-swap
pub const DEFAULT_MAX_CAS_ATTEMPTS: u32 = 8;

// 1 = written, 0 = version conflict, -1 = user missing
const CAS_USER: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then return -1 end
if current ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'doc', ARGV[2], 'version', ARGV[3])
return 1
"#;

// 2 = already settled, otherwise as CAS_USER
const SETTLE_REWARD: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then return 2 end
local current = redis.call('HGET', KEYS[1], 'version')
if not current then return -1 end
if current ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'doc', ARGV[2], 'version', ARGV[3])
redis.call('SET', KEYS[2], ARGV[4])
return 1
"#;

// 2 = stake ID taken, otherwise as CAS_USER
const CREATE_STAKE: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then return 2 end
local current = redis.call('HGET', KEYS[1], 'version')
if not current then return -1 end
if current ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'doc', ARGV[2], 'version', ARGV[3])
redis.call('SET', KEYS[2], ARGV[4])
redis.call('SADD', KEYS[3], ARGV[5])
return 1
"#;

// 1 = written, 0 = version conflict, -1 = stake missing
const SAVE_STAKE: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return -1 end
local stored = cjson.decode(current).version or 0
if stored ~= tonumber(ARGV[1]) then return 0 end
redis.call('SET', KEYS[1], ARGV[2])
if ARGV[3] == '1' then
  redis.call('SADD', KEYS[2], ARGV[4])
else
  redis.call('SREM', KEYS[2], ARGV[4])
end
return 1
"#;

// 1 = inserted, 0 = exists
const INSERT_USER: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'doc', ARGV[1], 'version', ARGV[2])
return 1
"#;

/// Redis-based ledger store
pub struct RedisLedgerStore {
    /// Redis client
    client: Client,
    /// Shared multiplexed connection
    connection: Arc<RwLock<Option<MultiplexedConnection>>>,
    /// Key prefix
    prefix: String,
    /// Attempts before a contended update gives up
    max_attempts: u32,
    cas_user: Script,
    settle_reward: Script,
    create_stake: Script,
    save_stake: Script,
    insert_user: Script,
}

impl RedisLedgerStore {
    /// Connect to Redis
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)
            .map_err(|e| StoreError::Backend(format!("Failed to create Redis client: {}", e)))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to connect to Redis: {}", e)))?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(Some(connection))),
            prefix: "stakeflow".to_string(),
            max_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
            cas_user: Script::new(CAS_USER),
            settle_reward: Script::new(SETTLE_REWARD),
            create_stake: Script::new(CREATE_STAKE),
            save_stake: Script::new(SAVE_STAKE),
            insert_user: Script::new(INSERT_USER),
        })
    }

    /// Use a custom key prefix
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Use a custom retry budget for contended updates
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    fn user_key(&self, user_id: &str) -> String {
        format!("{}:user:{}", self.prefix, user_id)
    }

    fn stake_key(&self, stake_id: &Uuid) -> String {
        format!("{}:stake:{}", self.prefix, stake_id)
    }

    fn pending_key(&self) -> String {
        format!("{}:stakes:pending", self.prefix)
    }

    fn reward_key(&self, stake_id: &Uuid) -> String {
        format!("{}:reward:{}", self.prefix, stake_id)
    }

    /// Get a connection, reconnecting if the shared one was dropped
    async fn get_connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let guard = self.connection.read().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        drop(guard);

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to reconnect to Redis: {}", e)))?;

        *guard = Some(connection.clone());
        Ok(connection)
    }

    async fn read_user(
        &self,
        conn: &mut MultiplexedConnection,
        user_id: &str,
    ) -> Result<Option<UserAccount>, StoreError> {
        let doc: Option<String> = conn
            .hget(self.user_key(user_id), "doc")
            .await
            .map_err(backend("HGET"))?;
        doc.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    /// Read, mutate and stage the next version of an account
    async fn prepare(
        &self,
        conn: &mut MultiplexedConnection,
        user_id: &str,
        mutation: &UserMutation<'_>,
    ) -> Result<(AccountChange, String), StoreError> {
        let before = self
            .read_user(conn, user_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;

        let mut after = before.clone();
        mutation(&mut after)?;
        after.version = before.version + 1;
        let doc = serde_json::to_string(&after)?;

        Ok((AccountChange { before, after }, doc))
    }

    async fn backoff(&self, key: &str, attempt: u32) {
        debug!(key, attempt, "Version conflict, retrying");
        tokio::time::sleep(Duration::from_millis(2u64 << attempt.min(6))).await;
    }

    fn contention(&self, key: String) -> StoreError {
        warn!(key = %key, attempts = self.max_attempts, "Giving up on contended update");
        StoreError::Contention {
            key,
            attempts: self.max_attempts,
        }
    }
}

fn backend(op: &'static str) -> impl Fn(redis::RedisError) -> StoreError {
    move |e| StoreError::Backend(format!("Redis {} failed: {}", op, e))
}

/// Decode the pending stake records fetched for `ids`.
///
/// A missing or unreadable record is logged and skipped so the remaining
/// stakes still get swept.
fn decode_pending(ids: &[String], docs: Vec<Option<String>>) -> Vec<Stake> {
    let mut stakes = Vec::with_capacity(docs.len());
    for (id, doc) in ids.iter().zip(docs) {
        match doc {
            Some(json) => match serde_json::from_str::<Stake>(&json) {
                Ok(stake) => stakes.push(stake),
                Err(e) => error!(stake_id = %id, error = %e, "Skipping unreadable stake record"),
            },
            None => warn!(stake_id = %id, "Pending stake has no record"),
        }
    }
    stakes
}

#[async_trait]
impl LedgerStore for RedisLedgerStore {
    #[instrument(skip(self))]
    async fn load_active_stakes(&self) -> Result<Vec<Stake>, StoreError> {
        let mut conn = self.get_connection().await?;

        let ids: Vec<String> = conn
            .smembers(self.pending_key())
            .await
            .map_err(backend("SMEMBERS"))?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}:stake:{}", self.prefix, id))
            .collect();
        let docs: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(backend("MGET"))?;

        let stakes = decode_pending(&ids, docs);
        debug!(count = stakes.len(), "Loaded pending stakes");
        Ok(stakes)
    }

    async fn load_stake(&self, id: &Uuid) -> Result<Option<Stake>, StoreError> {
        let mut conn = self.get_connection().await?;
        let doc: Option<String> = conn.get(self.stake_key(id)).await.map_err(backend("GET"))?;
        doc.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    #[instrument(skip(self, stake), fields(stake_id = %stake.id))]
    async fn save_stake(&self, stake: &Stake) -> Result<(), StoreError> {
        let mut next = stake.clone();
        next.version = stake.version + 1;
        let json = serde_json::to_string(&next)?;
        let mut conn = self.get_connection().await?;

        let status: i64 = self
            .save_stake
            .key(self.stake_key(&stake.id))
            .key(self.pending_key())
            .arg(stake.version)
            .arg(&json)
            .arg(if stake.is_pending() { "1" } else { "0" })
            .arg(stake.id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(backend("EVALSHA"))?;

        match status {
            1 => Ok(()),
            -1 => Err(StoreError::NotFound(format!("stake {}", stake.id))),
            _ => Err(StoreError::StaleStake {
                id: stake.id,
                expected: stake.version,
            }),
        }
    }

    #[instrument(skip(self, stake), fields(stake_id = %stake.id, owner = %stake.owner_id))]
    async fn create_stake(&self, stake: &Stake) -> Result<AccountChange, StoreError> {
        let user_key = self.user_key(&stake.owner_id);
        let stake_json = serde_json::to_string(stake)?;
        let principal = stake.principal;
        let mut conn = self.get_connection().await?;

        for attempt in 0..self.max_attempts {
            let (change, doc) = self
                .prepare(&mut conn, &stake.owner_id, &move |account: &mut UserAccount| {
                    account.debit(principal)
                })
                .await?;

            let status: i64 = self
                .create_stake
                .key(&user_key)
                .key(self.stake_key(&stake.id))
                .key(self.pending_key())
                .arg(change.before.version)
                .arg(&doc)
                .arg(change.after.version)
                .arg(&stake_json)
                .arg(stake.id.to_string())
                .invoke_async(&mut conn)
                .await
                .map_err(backend("EVALSHA"))?;

            match status {
                1 => return Ok(change),
                2 => return Err(StoreError::DuplicateStake(stake.id)),
                -1 => return Err(StoreError::NotFound(format!("user {}", stake.owner_id))),
                _ => self.backoff(&user_key, attempt).await,
            }
        }
        Err(self.contention(user_key))
    }

    async fn load_user(&self, user_id: &str) -> Result<Option<UserAccount>, StoreError> {
        let mut conn = self.get_connection().await?;
        self.read_user(&mut conn, user_id).await
    }

    async fn insert_user(&self, user: &UserAccount) -> Result<(), StoreError> {
        let doc = serde_json::to_string(user)?;
        let mut conn = self.get_connection().await?;

        let inserted: i64 = self
            .insert_user
            .key(self.user_key(&user.id))
            .arg(&doc)
            .arg(user.version)
            .invoke_async(&mut conn)
            .await
            .map_err(backend("EVALSHA"))?;

        if inserted == 1 {
            Ok(())
        } else {
            Err(StoreError::DuplicateUser(user.id.clone()))
        }
    }

    #[instrument(skip(self, mutation))]
    async fn update_user(
        &self,
        user_id: &str,
        mutation: &UserMutation<'_>,
    ) -> Result<AccountChange, StoreError> {
        let user_key = self.user_key(user_id);
        let mut conn = self.get_connection().await?;

        for attempt in 0..self.max_attempts {
            let (change, doc) = self.prepare(&mut conn, user_id, mutation).await?;

            let status: i64 = self
                .cas_user
                .key(&user_key)
                .arg(change.before.version)
                .arg(&doc)
                .arg(change.after.version)
                .invoke_async(&mut conn)
                .await
                .map_err(backend("EVALSHA"))?;

            match status {
                1 => return Ok(change),
                -1 => return Err(StoreError::NotFound(format!("user {}", user_id))),
                _ => self.backoff(&user_key, attempt).await,
            }
        }
        Err(self.contention(user_key))
    }

    #[instrument(skip(self))]
    async fn settle_reward(
        &self,
        stake_id: &Uuid,
        owner_id: &str,
        amount: Decimal,
    ) -> Result<Settlement, StoreError> {
        let user_key = self.user_key(owner_id);
        let reward_key = self.reward_key(stake_id);
        let entry_json = serde_json::to_string(&RewardEntry::new(*stake_id, owner_id, amount))?;
        let mut conn = self.get_connection().await?;

        for attempt in 0..self.max_attempts {
            let (change, doc) = self
                .prepare(&mut conn, owner_id, &move |account: &mut UserAccount| {
                    account.credit(amount)
                })
                .await?;

            let status: i64 = self
                .settle_reward
                .key(&user_key)
                .key(&reward_key)
                .arg(change.before.version)
                .arg(&doc)
                .arg(change.after.version)
                .arg(&entry_json)
                .invoke_async(&mut conn)
                .await
                .map_err(backend("EVALSHA"))?;

            match status {
                1 => return Ok(Settlement::Credited(change)),
                2 => {
                    let existing: String = conn.get(&reward_key).await.map_err(backend("GET"))?;
                    return Ok(Settlement::AlreadySettled(serde_json::from_str(&existing)?));
                }
                -1 => return Err(StoreError::NotFound(format!("user {}", owner_id))),
                _ => self.backoff(&user_key, attempt).await,
            }
        }
        Err(self.contention(user_key))
    }
}
