use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Value;
use secrecy::{ExposeSecret, SecretString};
use tokio::time::timeout;

use super::{Command, FastStore, Reply};
use crate::error::{Error, ErrorDetails};

/// Fast store backed by a single multiplexed Redis connection.
///
/// The connection is cheap to clone and shared by every caller; each
/// `pipeline` call is sent as one `MULTI`/`EXEC` block.
#[derive(Clone)]
pub struct RedisFastStore {
    conn: MultiplexedConnection,
    timeout: Duration,
}

impl RedisFastStore {
    pub async fn connect(url: &SecretString, timeout: Duration) -> Result<Self, Error> {
        let client = redis::Client::open(url.expose_secret()).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to get Redis connection: {e}"),
                })
            })?;
        tracing::info!("Connected to Redis fast store");
        Ok(Self { conn, timeout })
    }

    fn build_pipeline(commands: &[Command]) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in commands {
            match command {
                Command::Get { key } => {
                    pipe.cmd("GET").arg(key);
                }
                Command::SetEx { key, value, ttl } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("EX")
                        .arg(ttl_secs(*ttl));
                }
                Command::SetKeepTtl { key, value } => {
                    pipe.cmd("SET").arg(key).arg(value).arg("XX").arg("KEEPTTL");
                }
                Command::Del { key } => {
                    pipe.cmd("DEL").arg(key);
                }
                Command::Expire { key, ttl } => {
                    pipe.cmd("EXPIRE").arg(key).arg(ttl_secs(*ttl));
                }
                Command::HSet { key, fields } => {
                    let cmd = pipe.cmd("HSET").arg(key);
                    for (field, value) in fields {
                        cmd.arg(field).arg(value);
                    }
                }
                Command::HGetAll { key } => {
                    pipe.cmd("HGETALL").arg(key);
                }
                Command::HIncrBy { key, field, delta } => {
                    pipe.cmd("HINCRBY").arg(key).arg(field).arg(*delta);
                }
                Command::SAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member);
                }
                Command::SRem { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member);
                }
                Command::SMembers { key } => {
                    pipe.cmd("SMEMBERS").arg(key);
                }
                Command::ZAdd { key, member, score } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member);
                }
                Command::ZRemRangeByScore { key, max } => {
                    pipe.cmd("ZREMRANGEBYSCORE").arg(key).arg("-inf").arg(*max);
                }
                Command::ZCard { key } => {
                    pipe.cmd("ZCARD").arg(key);
                }
                Command::ZRangeByScore { key, min } => {
                    pipe.cmd("ZRANGEBYSCORE")
                        .arg(key)
                        .arg(format!("({min}"))
                        .arg("+inf");
                }
            }
        }
        pipe
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn convert_reply(command: &Command, value: &Value) -> Result<Reply, Error> {
    let reply = match command {
        Command::Get { .. } => match redis::from_redis_value::<Option<String>>(value)? {
            Some(s) => Reply::Str(s),
            None => Reply::Nil,
        },
        Command::SetEx { .. } => {
            // `SET .. EX` answers `OK`; anything else is a server error surfaced by the conversion
            redis::from_redis_value::<String>(value)?;
            Reply::Nil
        }
        // `XX` answers nil when the key is gone
        Command::SetKeepTtl { .. } => {
            let replaced = redis::from_redis_value::<Option<String>>(value)?.is_some();
            Reply::Int(i64::from(replaced))
        }
        Command::HGetAll { .. } => Reply::Hash(redis::from_redis_value(value)?),
        Command::SMembers { .. } | Command::ZRangeByScore { .. } => {
            Reply::Members(redis::from_redis_value(value)?)
        }
        Command::Del { .. }
        | Command::Expire { .. }
        | Command::HSet { .. }
        | Command::HIncrBy { .. }
        | Command::SAdd { .. }
        | Command::SRem { .. }
        | Command::ZAdd { .. }
        | Command::ZRemRangeByScore { .. }
        | Command::ZCard { .. } => Reply::Int(redis::from_redis_value(value)?),
    };
    Ok(reply)
}

#[async_trait]
impl FastStore for RedisFastStore {
    async fn pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>, Error> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let pipe = Self::build_pipeline(commands);
        let mut conn = self.conn.clone();
        let values: Vec<Value> = match timeout(self.timeout, pipe.query_async(&mut conn)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::new(ErrorDetails::FastStoreTimeout {
                    operation: commands
                        .iter()
                        .map(Command::name)
                        .collect::<Vec<_>>()
                        .join(","),
                    timeout_ms: self.timeout.as_millis() as u64,
                }));
            }
        };

        if values.len() != commands.len() {
            return Err(Error::new(ErrorDetails::FastStore {
                message: format!(
                    "Pipeline returned {} replies for {} commands",
                    values.len(),
                    commands.len()
                ),
            }));
        }

        commands
            .iter()
            .zip(values.iter())
            .map(|(command, value)| convert_reply(command, value))
            .collect()
    }
}
