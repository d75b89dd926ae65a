//! Long-poll wire contract
//!
//! A listener request carries the client's `group key -> fingerprint` map as
//! one string: every entry is `pool ^B item ^B tenant ^B fingerprint ^A`
//! (`^B` = 0x02 word separator, `^A` = 0x01 line separator), and the whole
//! body is prefixed with its byte length and `:`. The response is the set of
//! changed keys encoded the same way without fingerprints; an empty response
//! means "nothing changed before the hold expired".

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::executor::PoolSample;
use crate::model::{GroupKey, PoolConfig};

pub const WORD_SEPARATOR: char = '\u{2}';
pub const LINE_SEPARATOR: char = '\u{1}';
const LENGTH_SEPARATOR: char = ':';

/// Request header carrying the hold time the client is willing to wait for
pub const LONG_PULLING_TIMEOUT_HEADER: &str = "Long-Pulling-Timeout";

/// Request header naming the tenant the client belongs to
pub const TENANT_HEADER: &str = "Poolsync-Tenant";

pub const DEFAULT_HOLD: Duration = Duration::from_millis(30_000);
pub const DEFAULT_TIMEOUT_MARGIN: Duration = Duration::from_millis(3_000);

pub const HEALTH_PATH: &str = "/v1/cs/health";
pub const CONFIGS_PATH: &str = "/v1/cs/configs";
pub const LISTENER_PATH: &str = "/v1/cs/configs/listener";
pub const REGISTER_PATH: &str = "/v1/cs/configs/register";
pub const MONITOR_PATH: &str = "/v1/cs/monitor";

/// Client's known fingerprints, ordered so encoding is deterministic
pub type Probe = BTreeMap<GroupKey, String>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing length prefix")]
    MissingLengthPrefix,

    #[error("declared length {declared} does not match body length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("malformed entry {0:?}")]
    MalformedEntry(String),

    #[error(transparent)]
    InvalidKey(#[from] ValidationError),
}

fn push_key(out: &mut String, key: &GroupKey) {
    out.push_str(key.pool_id());
    out.push(WORD_SEPARATOR);
    out.push_str(key.item());
    out.push(WORD_SEPARATOR);
    out.push_str(key.tenant());
}

/// Encode a probe as a length-prefixed string of `key^fingerprint` tuples.
pub fn encode_probe(probe: &Probe) -> String {
    let mut body = String::new();
    for (key, fingerprint) in probe {
        push_key(&mut body, key);
        body.push(WORD_SEPARATOR);
        body.push_str(fingerprint);
        body.push(LINE_SEPARATOR);
    }
    format!("{}{LENGTH_SEPARATOR}{body}", body.len())
}

pub fn decode_probe(encoded: &str) -> Result<Probe, ProtocolError> {
    let body = strip_length_prefix(encoded)?;

    let mut probe = Probe::new();
    for line in body.split(LINE_SEPARATOR).filter(|line| !line.is_empty()) {
        let words: Vec<&str> = line.split(WORD_SEPARATOR).collect();
        let [pool_id, item, tenant, fingerprint] = words.as_slice() else {
            return Err(ProtocolError::MalformedEntry(line.to_string()));
        };
        let key = GroupKey::new(*tenant, *item, *pool_id)?;
        probe.insert(key, fingerprint.to_string());
    }
    Ok(probe)
}

fn strip_length_prefix(encoded: &str) -> Result<&str, ProtocolError> {
    let (declared, body) = encoded
        .split_once(LENGTH_SEPARATOR)
        .ok_or(ProtocolError::MissingLengthPrefix)?;
    let declared: usize = declared
        .parse()
        .map_err(|_| ProtocolError::MissingLengthPrefix)?;
    if declared != body.len() {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    Ok(body)
}

/// Encode the changed-key set of a listener response.
pub fn encode_keys<'a>(keys: impl IntoIterator<Item = &'a GroupKey>) -> String {
    let mut out = String::new();
    for key in keys {
        push_key(&mut out, key);
        out.push(LINE_SEPARATOR);
    }
    out
}

pub fn decode_keys(encoded: &str) -> Result<BTreeSet<GroupKey>, ProtocolError> {
    let mut keys = BTreeSet::new();
    for line in encoded.split(LINE_SEPARATOR).filter(|line| !line.is_empty()) {
        let words: Vec<&str> = line.split(WORD_SEPARATOR).collect();
        let [pool_id, item, tenant] = words.as_slice() else {
            return Err(ProtocolError::MalformedEntry(line.to_string()));
        };
        keys.insert(GroupKey::new(*tenant, *item, *pool_id)?);
    }
    Ok(keys)
}

/// Body of `POST /v1/cs/configs/listener`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerRequest {
    pub probe: String,
}

/// Query of `GET /v1/cs/configs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigQuery {
    pub tenant: String,
    pub item: String,
    pub pool: String,
}

impl ConfigQuery {
    pub fn for_key(key: &GroupKey) -> Self {
        Self {
            tenant: key.tenant().to_string(),
            item: key.item().to_string(),
            pool: key.pool_id().to_string(),
        }
    }

    pub fn group_key(&self) -> Result<GroupKey, ValidationError> {
        GroupKey::new(&self.tenant, &self.item, &self.pool)
    }
}

/// Body of `POST /v1/cs/configs` (operator write)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub group_key: GroupKey,
    pub config: PoolConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    pub version: u64,
    pub fingerprint: String,
}

/// Body of `POST /v1/cs/configs/register`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub group_key: GroupKey,
    pub config: PoolConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub version: u64,
    pub fingerprint: String,
    /// `false` when the key already existed and the server kept its content
    pub created: bool,
}

/// Body of `POST /v1/cs/monitor`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeReport {
    pub group_key: GroupKey,
    pub sample: PoolSample,
    pub reported_at: DateTime<Utc>,
}
