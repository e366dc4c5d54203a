//! KeyDB / Redis backed store.
//!
//! Layout:
//!
//! | Key                                     | Type   | Contents                                  |
//! |-----------------------------------------|--------|-------------------------------------------|
//! | `edgeupdates:update:next_id`            | string | id counter (`INCR`)                       |
//! | `edgeupdates:update:{id}`               | hash   | `account`, `state`, `payload`, `updated_at` |
//! | `edgeupdates:account:{account}:updates` | set    | ids owned by the account                  |
//!
//! `payload` is the JSON record.  The `state` and `updated_at` fields are
//! authoritative over the payload because the build lease rewrites them
//! without touching the JSON.

use std::collections::HashMap;

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::{ClientLike, HashesInterface, KeysInterface, LuaInterface, SetsInterface};
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::Builder;
use tracing::{debug, trace, warn};

use super::UpdateStore;
use crate::model::{NewUpdate, UpdateRecord, UpdateState};

const POOL_SIZE: usize = 4;

/// PENDING -> BUILDING only if the record is still PENDING.
const CLAIM_SCRIPT: &str = r#"
    local state = redis.call('HGET', KEYS[1], 'state')
    if state == 'PENDING' then
        redis.call('HSET', KEYS[1], 'state', 'BUILDING', 'updated_at', ARGV[1])
        return 1
    end
    return 0
"#;

/// Overwrite the record when its stored state is one of ARGV[4..].
/// Returns -1 when the record does not exist.
const SAVE_SCRIPT: &str = r#"
    local state = redis.call('HGET', KEYS[1], 'state')
    if not state then
        return -1
    end
    for i = 4, #ARGV do
        if ARGV[i] == state then
            redis.call('HSET', KEYS[1], 'state', ARGV[1], 'payload', ARGV[2], 'updated_at', ARGV[3])
            return 1
        end
    end
    return 0
"#;

pub struct KeyDbStore {
    pool: Pool,
}

impl KeyDbStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Connect using the application configuration.
    pub async fn connect(config: &crate::config::KeyDbConfig) -> Result<Self> {
        Ok(Self::new(create_keydb_pool(config).await?))
    }
}

#[async_trait::async_trait]
impl UpdateStore for KeyDbStore {
    async fn create(&self, account: &str, update: NewUpdate) -> Result<UpdateRecord> {
        let id: u64 = self
            .pool
            .incr(NEXT_ID_KEY)
            .await
            .context("INCR update id")?;
        let record = UpdateRecord::new(id, account, update);

        let _: () = self
            .pool
            .hset(update_key(id), record_to_pairs(&record)?)
            .await
            .context("HSET update record")?;
        let _: i64 = self
            .pool
            .sadd(account_key(account), id.to_string())
            .await
            .context("SADD account update")?;

        debug!(id, %account, "update record created");
        Ok(record)
    }

    async fn get(&self, account: &str, id: u64) -> Result<Option<UpdateRecord>> {
        let map: HashMap<String, String> = self
            .pool
            .hgetall(update_key(id))
            .await
            .context("HGETALL update record")?;
        if map.is_empty() {
            trace!(id, "update record not found");
            return Ok(None);
        }
        let record = record_from_map(&map)?;
        Ok((record.account == account).then_some(record))
    }

    async fn list(&self, account: &str) -> Result<Vec<UpdateRecord>> {
        let members: Vec<String> = self
            .pool
            .smembers(account_key(account))
            .await
            .context("SMEMBERS account updates")?;

        let mut ids: Vec<u64> = members.iter().filter_map(|m| m.parse().ok()).collect();
        ids.sort_unstable();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(account, id).await? {
                Some(record) => records.push(record),
                None => warn!(id, %account, "account index references a missing update"),
            }
        }
        Ok(records)
    }

    async fn save(&self, record: &UpdateRecord) -> Result<()> {
        let payload = serde_json::to_string(record).context("serialize update record")?;
        let mut args = vec![
            record.state.as_str().to_string(),
            payload,
            record.updated_at.to_rfc3339(),
        ];
        args.extend(allowed_prior_states(record.state).iter().map(|s| s.as_str().to_string()));

        let written: i64 = self
            .pool
            .eval(SAVE_SCRIPT, vec![update_key(record.id)], args)
            .await
            .context("update save script failed")?;
        match written {
            1 => Ok(()),
            -1 => anyhow::bail!("update {} does not exist", record.id),
            _ => anyhow::bail!(
                "update {} cannot be saved as {}: stored state moved on",
                record.id,
                record.state
            ),
        }
    }

    async fn claim_build(&self, id: u64) -> Result<bool> {
        let claimed: i64 = self
            .pool
            .eval(
                CLAIM_SCRIPT,
                vec![update_key(id)],
                vec![chrono::Utc::now().to_rfc3339()],
            )
            .await
            .context("build claim script failed")?;
        let claimed = claimed == 1;
        debug!(id, claimed, "claim_build");
        Ok(claimed)
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.pool.ping(None).await.context("KeyDB PING")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Key and field helpers
// ---------------------------------------------------------------------------

const NEXT_ID_KEY: &str = "edgeupdates:update:next_id";

fn update_key(id: u64) -> String {
    format!("edgeupdates:update:{id}")
}

fn account_key(account: &str) -> String {
    format!("edgeupdates:account:{account}:updates")
}

fn record_to_pairs(record: &UpdateRecord) -> Result<Vec<(String, String)>> {
    Ok(vec![
        ("account".into(), record.account.clone()),
        ("state".into(), record.state.as_str().to_string()),
        (
            "payload".into(),
            serde_json::to_string(record).context("serialize update record")?,
        ),
        ("updated_at".into(), record.updated_at.to_rfc3339()),
    ])
}

fn record_from_map(map: &HashMap<String, String>) -> Result<UpdateRecord> {
    let payload = map.get("payload").context("update record has no payload")?;
    let mut record: UpdateRecord =
        serde_json::from_str(payload).context("deserialize update record")?;

    if let Some(state) = map.get("state") {
        record.state = UpdateState::parse(state)
            .with_context(|| format!("unknown update state {state:?}"))?;
    }
    if let Some(ts) = map.get("updated_at") {
        record.updated_at = chrono::DateTime::parse_from_rfc3339(ts)
            .with_context(|| format!("invalid updated_at {ts:?}"))?
            .with_timezone(&chrono::Utc);
    }
    Ok(record)
}

/// Stored states from which a record may be overwritten with `next`.
fn allowed_prior_states(next: UpdateState) -> Vec<UpdateState> {
    [
        UpdateState::Pending,
        UpdateState::Building,
        UpdateState::Success,
        UpdateState::Error,
    ]
    .into_iter()
    .filter(|s| *s == next || s.can_transition_to(next))
    .collect()
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Create a KeyDB connection pool from the application configuration.
///
/// The pool is connected and PING-verified before being returned.  The auth
/// token is read from the environment variable named by
/// `config.auth_token_env`.
pub async fn create_keydb_pool(config: &crate::config::KeyDbConfig) -> Result<Pool> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    let endpoint = config
        .endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");
    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(host, port),
        ..fred::types::config::Config::default()
    };
    if config.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }
    if let Some(token) = auth_token {
        fred_config.password = Some(token);
    }

    let mut builder = Builder::from_config(fred_config);
    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(POOL_SIZE)
        .context("failed to build KeyDB connection pool")?;
    pool.init().await.context("failed to connect to KeyDB")?;

    let _: String = pool
        .ping(None)
        .await
        .context("KeyDB PING failed after connect")?;

    tracing::info!(
        host = host,
        port = port,
        tls = config.tls,
        pool_size = POOL_SIZE,
        "KeyDB pool created and verified"
    );
    Ok(pool)
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}
