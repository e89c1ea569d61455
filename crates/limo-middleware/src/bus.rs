//! Key-value store and publish/subscribe bus client.
//!
//! Robots and the control center meet on a Redis-compatible server: robots
//! publish heartbeats, positions and map diffs on well-known channels, and
//! the control center mirrors its view of the fleet into plain keys, hashes
//! and sets so consoles can ask for a full snapshot at any time.
//!
//! [`MessageBus`] is the seam between the fleet logic and the server.  Every
//! request/response operation is a *blocking* call; callers running on an
//! async runtime push them onto the blocking pool.  Subscriptions never
//! block the caller: each one gets a dedicated listener thread that invokes
//! a [`MessageHandler`] per message until its [`CancellationToken`] fires.
//!
//! | Implementation | Backing | Used by |
//! |---|---|---|
//! | [`RedisBus`] | `r2d2` pool of Redis connections + one connection per subscription | the `limo` binary |
//! | [`MemoryBus`] | in-process maps, handlers invoked on the publisher's thread | tests |

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use limo_types::LimoError;
use redis::{Commands, IntoConnectionInfo};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Callback invoked as `handler(channel, message)` for every message a
/// subscription receives.
pub type MessageHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Key written, read back and deleted by [`self_test`].
pub const SELF_TEST_KEY: &str = "limo control center test";
const SELF_TEST_VALUE: &str = "ok";

// ────────────────────────────────────────────────────────────────────────────
// MessageBus trait
// ────────────────────────────────────────────────────────────────────────────

/// Operations the control center needs from the store.
///
/// All methods block until the server answers.  Failures surface as
/// [`LimoError::Connectivity`].
pub trait MessageBus: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, LimoError>;
    fn set(&self, key: &str, value: &str) -> Result<(), LimoError>;
    fn del(&self, key: &str) -> Result<(), LimoError>;

    fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), LimoError>;
    /// Set many fields of one hash in a single round trip.
    fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<(), LimoError>;
    fn hdel(&self, key: &str, field: &str) -> Result<(), LimoError>;
    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, LimoError>;

    fn sadd(&self, key: &str, member: &str) -> Result<(), LimoError>;
    fn srem(&self, key: &str, member: &str) -> Result<(), LimoError>;
    fn smembers(&self, key: &str) -> Result<Vec<String>, LimoError>;

    fn publish(&self, channel: &str, message: &str) -> Result<(), LimoError>;

    /// Start listening on `channels`.
    ///
    /// Returns once the subscription is established.  From then on `handler`
    /// is called for every message until `cancel` is cancelled.
    ///
    /// # Errors
    ///
    /// [`LimoError::Connectivity`] when the subscription cannot be set up.
    fn subscribe(
        &self,
        channels: &[String],
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<Subscription, LimoError>;
}

/// Handle to a running subscription.
///
/// Dropping the handle does **not** stop the listener; process-lifetime
/// subscriptions are simply forgotten.  Call [`Subscription::cancel`] (or
/// cancel the token passed to [`MessageBus::subscribe`]) to stop it.
#[derive(Debug, Clone)]
pub struct Subscription {
    channels: Vec<String>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(channels: Vec<String>, cancel: CancellationToken) -> Self {
        Self { channels, cancel }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Startup probe
// ────────────────────────────────────────────────────────────────────────────

/// Write, read back and delete [`SELF_TEST_KEY`].
///
/// # Errors
///
/// [`LimoError::Connectivity`] if any step fails or the value read back
/// differs from the value written.
pub fn self_test(bus: &dyn MessageBus) -> Result<(), LimoError> {
    bus.set(SELF_TEST_KEY, SELF_TEST_VALUE)?;
    let read_back = bus.get(SELF_TEST_KEY)?;
    bus.del(SELF_TEST_KEY)?;
    match read_back.as_deref() {
        Some(SELF_TEST_VALUE) => Ok(()),
        other => Err(LimoError::Connectivity(format!(
            "self-test read back {other:?}, expected {SELF_TEST_VALUE:?}"
        ))),
    }
}

/// Connect and self-test the store, retrying with a fixed `retry_delay`
/// until it succeeds.
///
/// Every attempt runs on the blocking pool and every failure is logged at
/// `error`.  Returns `None` only when `cancel` fires before a connection is
/// established.
pub async fn connect_with_retry<B, F>(
    connect: F,
    retry_delay: Duration,
    cancel: &CancellationToken,
) -> Option<B>
where
    B: MessageBus + 'static,
    F: Fn() -> Result<B, LimoError> + Send + Sync + 'static,
{
    let connect = Arc::new(connect);
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let try_connect = Arc::clone(&connect);
        let outcome = tokio::task::spawn_blocking(move || {
            let bus = try_connect()?;
            self_test(&bus)?;
            Ok::<B, LimoError>(bus)
        })
        .await
        .unwrap_or_else(|e| Err(LimoError::Connectivity(format!("connect task failed: {e}"))));

        match outcome {
            Ok(bus) => {
                info!(attempt, "store connection verified");
                return Some(bus);
            }
            Err(e) => {
                error!(
                    attempt,
                    error = %e,
                    retry_in_ms = retry_delay.as_millis() as u64,
                    "store unreachable, retrying"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RedisBus
// ────────────────────────────────────────────────────────────────────────────

/// Connection parameters for [`RedisBus`].
#[derive(Clone)]
pub struct BusSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: i64,
    /// Maximum pooled connections for request/response operations.
    pub pool_size: u32,
    /// How long an operation waits for a free pooled connection.
    pub pool_wait: Duration,
    /// Read timeout of subscription connections; bounds how long a
    /// cancelled listener takes to notice.
    pub listener_poll: Duration,
    /// Pause before a listener reconnects after losing its connection.
    pub listener_retry: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            user: "default".to_string(),
            password: None,
            database: 0,
            pool_size: 8,
            pool_wait: Duration::from_millis(1000),
            listener_poll: Duration::from_millis(250),
            listener_retry: Duration::from_secs(1),
        }
    }
}

impl fmt::Debug for BusSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database", &self.database)
            .field("pool_size", &self.pool_size)
            .field("pool_wait", &self.pool_wait)
            .finish()
    }
}

/// [`MessageBus`] backed by a Redis server.
pub struct RedisBus {
    client: redis::Client,
    pool: r2d2::Pool<redis::Client>,
    listener_poll: Duration,
    listener_retry: Duration,
}

impl RedisBus {
    /// Build the client and connection pool.
    ///
    /// The pool opens its connections eagerly, so an unreachable server
    /// fails here.
    ///
    /// # Errors
    ///
    /// [`LimoError::Connectivity`] when the server cannot be reached.
    pub fn connect(settings: &BusSettings) -> Result<Self, LimoError> {
        let mut info = (settings.host.as_str(), settings.port)
            .into_connection_info()
            .map_err(connectivity)?;
        info.redis.db = settings.database;
        info.redis.username = Some(settings.user.clone());
        info.redis.password = settings.password.clone();

        let client = redis::Client::open(info).map_err(connectivity)?;
        let pool = r2d2::Pool::builder()
            .max_size(settings.pool_size.max(1))
            .connection_timeout(settings.pool_wait)
            .build(client.clone())
            .map_err(|e| LimoError::Connectivity(e.to_string()))?;

        debug!(host = %settings.host, port = settings.port, pool_size = settings.pool_size, "redis pool ready");
        Ok(Self {
            client,
            pool,
            listener_poll: settings.listener_poll,
            listener_retry: settings.listener_retry,
        })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<redis::Client>, LimoError> {
        self.pool
            .get()
            .map_err(|e| LimoError::Connectivity(e.to_string()))
    }
}

fn connectivity(e: redis::RedisError) -> LimoError {
    LimoError::Connectivity(e.to_string())
}

impl MessageBus for RedisBus {
    fn get(&self, key: &str) -> Result<Option<String>, LimoError> {
        self.conn()?.get::<_, Option<String>>(key).map_err(connectivity)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LimoError> {
        self.conn()?.set::<_, _, ()>(key, value).map_err(connectivity)
    }

    fn del(&self, key: &str) -> Result<(), LimoError> {
        self.conn()?.del::<_, ()>(key).map_err(connectivity)
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), LimoError> {
        self.conn()?
            .hset::<_, _, _, ()>(key, field, value)
            .map_err(connectivity)
    }

    fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<(), LimoError> {
        if fields.is_empty() {
            return Ok(());
        }
        self.conn()?
            .hset_multiple::<_, _, _, ()>(key, fields)
            .map_err(connectivity)
    }

    fn hdel(&self, key: &str, field: &str) -> Result<(), LimoError> {
        self.conn()?.hdel::<_, _, ()>(key, field).map_err(connectivity)
    }

    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, LimoError> {
        self.conn()?
            .hgetall::<_, HashMap<String, String>>(key)
            .map_err(connectivity)
    }

    fn sadd(&self, key: &str, member: &str) -> Result<(), LimoError> {
        self.conn()?.sadd::<_, _, ()>(key, member).map_err(connectivity)
    }

    fn srem(&self, key: &str, member: &str) -> Result<(), LimoError> {
        self.conn()?.srem::<_, _, ()>(key, member).map_err(connectivity)
    }

    fn smembers(&self, key: &str) -> Result<Vec<String>, LimoError> {
        self.conn()?
            .smembers::<_, Vec<String>>(key)
            .map_err(connectivity)
    }

    fn publish(&self, channel: &str, message: &str) -> Result<(), LimoError> {
        self.conn()?
            .publish::<_, _, ()>(channel, message)
            .map_err(connectivity)
    }

    fn subscribe(
        &self,
        channels: &[String],
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<Subscription, LimoError> {
        let listener = RedisListener {
            client: self.client.clone(),
            channels: channels.to_vec(),
            handler,
            cancel: cancel.clone(),
            poll: self.listener_poll,
            retry: self.listener_retry,
        };

        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        thread::Builder::new()
            .name(format!("limo-sub-{}", channels.join("+")))
            .spawn(move || listener.run(ready_tx))
            .map_err(|e| LimoError::Io(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Subscription::new(channels.to_vec(), cancel)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LimoError::Connectivity(
                "subscription listener exited before subscribing".to_string(),
            )),
        }
    }
}

/// State owned by one subscription's listener thread.
struct RedisListener {
    client: redis::Client,
    channels: Vec<String>,
    handler: MessageHandler,
    cancel: CancellationToken,
    poll: Duration,
    retry: Duration,
}

impl RedisListener {
    /// Listen until cancelled, reconnecting after connection loss.
    ///
    /// The outcome of the first subscribe attempt is reported on `ready`.
    fn run(self, ready: std_mpsc::SyncSender<Result<(), LimoError>>) {
        let mut ready = Some(ready);
        while !self.cancel.is_cancelled() {
            match self.listen_once(&mut ready) {
                Ok(()) => break,
                Err(e) => {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(e));
                        return;
                    }
                    error!(channels = ?self.channels, error = %e, "subscription lost, reconnecting");
                    thread::sleep(self.retry);
                }
            }
        }
        debug!(channels = ?self.channels, "subscription stopped");
    }

    fn listen_once(
        &self,
        ready: &mut Option<std_mpsc::SyncSender<Result<(), LimoError>>>,
    ) -> Result<(), LimoError> {
        let mut conn = self.client.get_connection().map_err(connectivity)?;
        conn.set_read_timeout(Some(self.poll))
            .map_err(connectivity)?;
        let mut pubsub = conn.as_pubsub();
        for channel in &self.channels {
            pubsub.subscribe(channel).map_err(connectivity)?;
        }
        if let Some(ready) = ready.take() {
            let _ = ready.send(Ok(()));
        }
        debug!(channels = ?self.channels, "subscribed");

        while !self.cancel.is_cancelled() {
            match pubsub.get_message() {
                Ok(msg) => match msg.get_payload::<String>() {
                    Ok(payload) => (self.handler)(msg.get_channel_name(), &payload),
                    Err(e) => warn!(
                        channel = %msg.get_channel_name(),
                        error = %e,
                        "dropping non-text message"
                    ),
                },
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(connectivity(e)),
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MemoryBus
// ────────────────────────────────────────────────────────────────────────────

/// In-process [`MessageBus`].
///
/// [`publish`][MessageBus::publish] invokes matching handlers synchronously on
/// the publisher's thread, after releasing the internal lock.  Setting the bus
/// [offline][MemoryBus::set_offline] makes every operation fail with
/// [`LimoError::Connectivity`].
#[derive(Default)]
pub struct MemoryBus {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    offline: bool,
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    subscribers: Vec<MemorySubscriber>,
    published: Vec<(String, String)>,
}

struct MemorySubscriber {
    channels: Vec<String>,
    handler: MessageHandler,
    cancel: CancellationToken,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (`true`) or regaining (`false`) the server.
    pub fn set_offline(&self, offline: bool) {
        self.lock_state().offline = offline;
    }

    /// Every `(channel, message)` published so far, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.lock_state().published.clone()
    }

    /// Number of subscriptions whose token has not been cancelled.
    pub fn active_subscriptions(&self) -> usize {
        self.lock_state()
            .subscribers
            .iter()
            .filter(|s| !s.cancel.is_cancelled())
            .count()
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn online(&self) -> Result<MutexGuard<'_, MemoryState>, LimoError> {
        let state = self.lock_state();
        if state.offline {
            return Err(LimoError::Connectivity("memory bus offline".to_string()));
        }
        Ok(state)
    }
}

impl MessageBus for MemoryBus {
    fn get(&self, key: &str) -> Result<Option<String>, LimoError> {
        Ok(self.online()?.strings.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LimoError> {
        self.online()?
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn del(&self, key: &str) -> Result<(), LimoError> {
        let mut state = self.online()?;
        state.strings.remove(key);
        state.hashes.remove(key);
        state.sets.remove(key);
        Ok(())
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), LimoError> {
        self.online()?
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<(), LimoError> {
        let mut state = self.online()?;
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    fn hdel(&self, key: &str, field: &str) -> Result<(), LimoError> {
        if let Some(hash) = self.online()?.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, LimoError> {
        Ok(self.online()?.hashes.get(key).cloned().unwrap_or_default())
    }

    fn sadd(&self, key: &str, member: &str) -> Result<(), LimoError> {
        self.online()?
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    fn srem(&self, key: &str, member: &str) -> Result<(), LimoError> {
        if let Some(set) = self.online()?.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    fn smembers(&self, key: &str) -> Result<Vec<String>, LimoError> {
        Ok(self
            .online()?
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn publish(&self, channel: &str, message: &str) -> Result<(), LimoError> {
        let handlers: Vec<MessageHandler> = {
            let mut state = self.online()?;
            state
                .published
                .push((channel.to_string(), message.to_string()));
            state.subscribers.retain(|s| !s.cancel.is_cancelled());
            state
                .subscribers
                .iter()
                .filter(|s| s.channels.iter().any(|c| c == channel))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        for handler in handlers {
            handler(channel, message);
        }
        Ok(())
    }

    fn subscribe(
        &self,
        channels: &[String],
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<Subscription, LimoError> {
        self.online()?.subscribers.push(MemorySubscriber {
            channels: channels.to_vec(),
            handler,
            cancel: cancel.clone(),
        });
        Ok(Subscription::new(channels.to_vec(), cancel))
    }
}
