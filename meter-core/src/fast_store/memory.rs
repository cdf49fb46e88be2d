//! In-process fast store with Redis-compatible semantics for the commands we use.
//!
//! Used by tests and by `meterd --dry-run`. Expiry is evaluated lazily against
//! an injected [`Clock`], so tests can move time forward without sleeping.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Command, FastStore, Reply};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, ErrorDetails};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
}

impl State {
    fn purge_expired(&mut self, key: &str, now: DateTime<Utc>) {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
        }
    }

    fn live(&mut self, key: &str, now: DateTime<Utc>) -> Option<&mut Entry> {
        self.purge_expired(key, now);
        self.entries.get_mut(key)
    }

    fn remove_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::Hash(h)) => h.is_empty(),
            Some(Value::Set(s)) => s.is_empty(),
            Some(Value::ZSet(z)) => z.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }
}

pub struct MemoryFastStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    round_trips: AtomicU64,
    failing: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl Default for MemoryFastStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryFastStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            round_trips: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            latency: Mutex::new(None),
        }
    }

    /// Number of `pipeline` calls observed so far, including failed ones.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }

    pub fn reset_round_trips(&self) {
        self.round_trips.store(0, Ordering::SeqCst);
    }

    /// While set, every pipeline fails as if the store were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delays every pipeline by `latency` before it is applied.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        match self.state.lock() {
            Ok(mut state) => state.live(key, now).is_some(),
            Err(_) => false,
        }
    }

    /// Remaining time to live of `key`, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let mut state = self.state.lock().ok()?;
        let expires_at = state.live(key, now)?.expires_at?;
        (expires_at - now).to_std().ok()
    }

    fn apply(state: &mut State, now: DateTime<Utc>, command: &Command) -> Result<Reply, Error> {
        let reply = match command {
            Command::Get { key } => match state.live(key, now).map(|e| &e.value) {
                Some(Value::Str(s)) => Reply::Str(s.clone()),
                Some(_) => return Err(wrong_type(command)),
                None => Reply::Nil,
            },
            Command::SetEx { key, value, ttl } => {
                state.entries.insert(
                    key.clone(),
                    Entry {
                        value: Value::Str(value.clone()),
                        expires_at: Some(expiry(now, *ttl)),
                    },
                );
                Reply::Nil
            }
            Command::SetKeepTtl { key, value } => match state.live(key, now) {
                Some(entry) => {
                    entry.value = Value::Str(value.clone());
                    Reply::Int(1)
                }
                None => Reply::Int(0),
            },
            Command::Del { key } => {
                state.purge_expired(key, now);
                Reply::Int(i64::from(state.entries.remove(key).is_some()))
            }
            Command::Expire { key, ttl } => match state.live(key, now) {
                Some(entry) => {
                    entry.expires_at = Some(expiry(now, *ttl));
                    Reply::Int(1)
                }
                None => Reply::Int(0),
            },
            Command::HSet { key, fields } => {
                let hash = hash_mut(state, key, now, command)?;
                let mut added = 0;
                for (field, value) in fields {
                    if hash.insert(field.clone(), value.clone()).is_none() {
                        added += 1;
                    }
                }
                Reply::Int(added)
            }
            Command::HGetAll { key } => match state.live(key, now).map(|e| &e.value) {
                Some(Value::Hash(h)) => Reply::Hash(h.clone()),
                Some(_) => return Err(wrong_type(command)),
                None => Reply::Hash(HashMap::new()),
            },
            Command::HIncrBy { key, field, delta } => {
                let hash = hash_mut(state, key, now, command)?;
                let current = match hash.get(field) {
                    Some(raw) => raw.parse::<i64>().map_err(|_| {
                        Error::new(ErrorDetails::FastStore {
                            message: format!("hash value at `{key}`.`{field}` is not an integer"),
                        })
                    })?,
                    None => 0,
                };
                let updated = current.checked_add(*delta).ok_or_else(|| {
                    Error::new(ErrorDetails::FastStore {
                        message: format!("increment at `{key}`.`{field}` would overflow"),
                    })
                })?;
                hash.insert(field.clone(), updated.to_string());
                Reply::Int(updated)
            }
            Command::SAdd { key, member } => {
                let set = set_mut(state, key, now, command)?;
                Reply::Int(i64::from(set.insert(member.clone())))
            }
            Command::SRem { key, member } => {
                let removed = match state.live(key, now).map(|e| &mut e.value) {
                    Some(Value::Set(s)) => s.remove(member),
                    Some(_) => return Err(wrong_type(command)),
                    None => false,
                };
                state.remove_if_empty(key);
                Reply::Int(i64::from(removed))
            }
            Command::SMembers { key } => match state.live(key, now).map(|e| &e.value) {
                Some(Value::Set(s)) => Reply::Members(s.iter().cloned().collect()),
                Some(_) => return Err(wrong_type(command)),
                None => Reply::Members(Vec::new()),
            },
            Command::ZAdd { key, member, score } => {
                let zset = zset_mut(state, key, now, command)?;
                Reply::Int(i64::from(zset.insert(member.clone(), *score).is_none()))
            }
            Command::ZRemRangeByScore { key, max } => {
                let removed = match state.live(key, now).map(|e| &mut e.value) {
                    Some(Value::ZSet(z)) => {
                        let before = z.len();
                        z.retain(|_, score| *score > *max);
                        (before - z.len()) as i64
                    }
                    Some(_) => return Err(wrong_type(command)),
                    None => 0,
                };
                state.remove_if_empty(key);
                Reply::Int(removed)
            }
            Command::ZCard { key } => match state.live(key, now).map(|e| &e.value) {
                Some(Value::ZSet(z)) => Reply::Int(z.len() as i64),
                Some(_) => return Err(wrong_type(command)),
                None => Reply::Int(0),
            },
            Command::ZRangeByScore { key, min } => match state.live(key, now).map(|e| &e.value) {
                Some(Value::ZSet(z)) => {
                    let mut members: Vec<(&String, &f64)> =
                        z.iter().filter(|(_, score)| **score > *min).collect();
                    members.sort_by(|a, b| a.1.total_cmp(b.1).then_with(|| a.0.cmp(b.0)));
                    Reply::Members(members.into_iter().map(|(m, _)| m.clone()).collect())
                }
                Some(_) => return Err(wrong_type(command)),
                None => Reply::Members(Vec::new()),
            },
        };
        Ok(reply)
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let secs = ttl.as_secs().max(1);
    now + chrono::Duration::seconds(secs as i64)
}

fn wrong_type(command: &Command) -> Error {
    Error::new(ErrorDetails::FastStore {
        message: format!(
            "WRONGTYPE Operation against a key holding the wrong kind of value ({})",
            command.name()
        ),
    })
}

fn entry_or_insert<'a>(
    state: &'a mut State,
    key: &str,
    now: DateTime<Utc>,
    empty: Value,
) -> &'a mut Entry {
    state.purge_expired(key, now);
    state.entries.entry(key.to_string()).or_insert(Entry {
        value: empty,
        expires_at: None,
    })
}

fn hash_mut<'a>(
    state: &'a mut State,
    key: &str,
    now: DateTime<Utc>,
    command: &Command,
) -> Result<&'a mut HashMap<String, String>, Error> {
    match &mut entry_or_insert(state, key, now, Value::Hash(HashMap::new())).value {
        Value::Hash(h) => Ok(h),
        _ => Err(wrong_type(command)),
    }
}

fn set_mut<'a>(
    state: &'a mut State,
    key: &str,
    now: DateTime<Utc>,
    command: &Command,
) -> Result<&'a mut BTreeSet<String>, Error> {
    match &mut entry_or_insert(state, key, now, Value::Set(BTreeSet::new())).value {
        Value::Set(s) => Ok(s),
        _ => Err(wrong_type(command)),
    }
}

fn zset_mut<'a>(
    state: &'a mut State,
    key: &str,
    now: DateTime<Utc>,
    command: &Command,
) -> Result<&'a mut HashMap<String, f64>, Error> {
    match &mut entry_or_insert(state, key, now, Value::ZSet(HashMap::new())).value {
        Value::ZSet(z) => Ok(z),
        _ => Err(wrong_type(command)),
    }
}

#[async_trait]
impl FastStore for MemoryFastStore {
    async fn pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>, Error> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency.lock().ok().and_then(|guard| *guard);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorDetails::FastStore {
                message: "connection refused".to_string(),
            }));
        }

        let now = self.clock.now();
        let mut state = self.state.lock().map_err(|_| {
            Error::new(ErrorDetails::FastStore {
                message: "memory fast store lock poisoned".to_string(),
            })
        })?;
        // Like `EXEC`, a failing command does not stop or undo the rest.
        let mut replies = Vec::with_capacity(commands.len());
        let mut first_error = None;
        for command in commands {
            match Self::apply(&mut state, now, command) {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(replies),
        }
    }
}
