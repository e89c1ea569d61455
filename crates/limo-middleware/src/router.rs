//! [`UpdateRouter`] – decode, apply, fan out and mirror robot traffic.
//!
//! One dispatch path per bus channel:
//!
//! | Channel | Message | Effect |
//! |---|---|---|
//! | `general` | `"<id> keep_alive"` | registry heartbeat; on first sight add to `robots`, subscribe robot-scoped channels |
//! | `update_pos`, `"<id> update_pos"` | `"<id> x,y,angle"` | registry position, fan out to position sinks, mirror into `robots:pos` |
//! | `update_map`, `"<id> update_map"` | `"<id> <diff>"` | quantize, fan out body to map sinks, mirror into `map` |
//! | `update_goal` | `"<id> x,y"` / `"<id> remove"` | registry goal, fan out to goal sinks, mirror into `robots:goals` |
//!
//! Positions and goals are fanned out and mirrored whether or not the robot
//! has been heard on `general` yet; only the registry's last-known values
//! require a live robot.
//!
//! Mirror writes go through one bounded queue drained by a single worker on
//! the blocking pool, so they reach the store in the order they were
//! issued.  They are best effort: a failure is logged and dropped, and a
//! full queue drops the write.  The live registry is authoritative; the
//! store is a cache for snapshot replay.
//!
//! [`UpdateRouter::spawn_sweeper`] runs the periodic eviction that turns
//! silence into a `"<id> remove"` tombstone on the position and goal topics.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use limo_kernel::{Evicted, Heartbeat, RobotRegistry};
use limo_perception::{MapDiff, Quantizer};
use limo_types::{
    GoalUpdate, LimoError, Pose, Topic, channels, keys, split_robot_id,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, MessageHandler, Subscription};
use crate::sinks::Sinks;

/// Maximum map points per outgoing frame.
pub const DEFAULT_MAX_POINTS_PER_FRAME: usize = 20_000;

/// Pending mirror writes before new ones are dropped.
pub const MIRROR_QUEUE_CAPACITY: usize = 4096;

type MirrorWrite = Box<dyn FnOnce(&dyn MessageBus) -> Result<(), LimoError> + Send>;

/// Tunables of the router.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub quantizer: Quantizer,
    pub max_points_per_frame: usize,
    /// Subscribe `"<id> update_pos"` / `"<id> update_map"` for every live robot.
    pub per_robot_channels: bool,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            quantizer: Quantizer::default(),
            max_points_per_frame: DEFAULT_MAX_POINTS_PER_FRAME,
            per_robot_channels: true,
        }
    }
}

/// Fixed channels every router listens on.
pub fn global_channels() -> Vec<String> {
    [
        channels::GENERAL,
        channels::UPDATE_POS,
        channels::UPDATE_MAP,
        channels::UPDATE_GOAL,
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Robot-scoped channels subscribed while `robot_id` is live.
pub fn robot_channels(robot_id: &str) -> Vec<String> {
    vec![
        channels::robot_scoped(robot_id, channels::UPDATE_POS),
        channels::robot_scoped(robot_id, channels::UPDATE_MAP),
    ]
}

/// Routes bus messages into the registry, the console sinks and the store.
pub struct UpdateRouter {
    registry: Arc<RobotRegistry>,
    sinks: Arc<Sinks>,
    bus: Arc<dyn MessageBus>,
    settings: RouterSettings,
    runtime: Handle,
    mirror_tx: mpsc::Sender<(&'static str, MirrorWrite)>,
    this: Weak<UpdateRouter>,
}

impl UpdateRouter {
    /// Create a router bound to the current Tokio runtime and start its
    /// mirror worker.  The worker stops once the router is dropped.
    ///
    /// # Errors
    ///
    /// [`LimoError::Config`] when called outside a Tokio runtime.
    pub fn new(
        registry: Arc<RobotRegistry>,
        sinks: Arc<Sinks>,
        bus: Arc<dyn MessageBus>,
        settings: RouterSettings,
    ) -> Result<Arc<Self>, LimoError> {
        let runtime = Handle::try_current()
            .map_err(|e| LimoError::Config(format!("router needs a tokio runtime: {e}")))?;
        let (mirror_tx, mirror_rx) = mpsc::channel(MIRROR_QUEUE_CAPACITY);
        let worker_bus = Arc::clone(&bus);
        runtime.spawn_blocking(move || run_mirror_worker(worker_bus, mirror_rx));
        Ok(Arc::new_cyclic(|this| Self {
            registry,
            sinks,
            bus,
            settings,
            runtime,
            mirror_tx,
            this: this.clone(),
        }))
    }

    pub fn registry(&self) -> &Arc<RobotRegistry> {
        &self.registry
    }

    pub fn sinks(&self) -> &Arc<Sinks> {
        &self.sinks
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Reset the mirrored live set and subscribe the fixed channels.
    ///
    /// Blocking; call it from the blocking pool or before serving.
    ///
    /// # Errors
    ///
    /// [`LimoError::Connectivity`] when the store rejects either step.
    pub fn start(&self, cancel: CancellationToken) -> Result<Subscription, LimoError> {
        self.bus.del(keys::ROBOTS)?;
        let subscription = self
            .bus
            .subscribe(&global_channels(), self.handler(), cancel)?;
        info!(channels = ?subscription.channels(), "router listening");
        Ok(subscription)
    }

    /// Bus callback that dispatches into this router and logs rejects.
    ///
    /// Holds only a weak reference, so a dropped router simply stops
    /// handling messages.
    pub fn handler(&self) -> MessageHandler {
        let router = self.this.clone();
        Arc::new(move |channel: &str, message: &str| {
            if let Some(router) = router.upgrade() {
                if let Err(e) = router.handle_message(channel, message) {
                    warn!(channel = %channel, error = %e, "message dropped");
                }
            }
        })
    }

    /// Decode and apply one bus message.
    ///
    /// # Errors
    ///
    /// [`LimoError::Protocol`] for an unknown channel or a message that does
    /// not match its channel's wire format.  Nothing is applied in that case.
    pub fn handle_message(&self, channel: &str, message: &str) -> Result<(), LimoError> {
        // Robot-scoped channels are "<id> <base>".
        let base = channel.rsplit(' ').next().unwrap_or(channel);
        match base {
            channels::GENERAL => self.on_general(channel, message),
            channels::UPDATE_POS => self.on_position(channel, message),
            channels::UPDATE_MAP => self.on_map(channel, message),
            channels::UPDATE_GOAL => self.on_goal(channel, message),
            _ => Err(LimoError::protocol(channel, message, "unknown channel")),
        }
    }

    fn on_general(&self, channel: &str, message: &str) -> Result<(), LimoError> {
        let (robot_id, command) =
            split_robot_id(message).map_err(|e| LimoError::protocol(channel, message, e))?;
        if command.trim() != channels::KEEP_ALIVE {
            return Err(LimoError::protocol(channel, message, "unknown command"));
        }
        self.heartbeat(robot_id, Utc::now());
        Ok(())
    }

    /// Apply a heartbeat received at `at`.
    pub fn heartbeat(&self, robot_id: &str, at: DateTime<Utc>) {
        match self.registry.heartbeat(robot_id, at) {
            Heartbeat::Refreshed => debug!(robot_id = %robot_id, "heartbeat"),
            Heartbeat::Registered { listener } => {
                info!(robot_id = %robot_id, "robot connected");
                let id = robot_id.to_string();
                self.mirror("sadd robots", move |bus| bus.sadd(keys::ROBOTS, &id));
                if self.settings.per_robot_channels {
                    self.subscribe_robot(robot_id, listener);
                }
            }
        }
    }

    fn subscribe_robot(&self, robot_id: &str, listener: CancellationToken) {
        let bus = Arc::clone(&self.bus);
        let handler = self.handler();
        let id = robot_id.to_string();
        self.runtime.spawn_blocking(move || {
            match bus.subscribe(&robot_channels(&id), handler, listener) {
                Ok(_) => debug!(robot_id = %id, "robot channels subscribed"),
                Err(e) => warn!(robot_id = %id, error = %e, "robot channel subscription failed"),
            }
        });
    }

    fn on_position(&self, channel: &str, message: &str) -> Result<(), LimoError> {
        let (robot_id, payload) =
            split_robot_id(message).map_err(|e| LimoError::protocol(channel, message, e))?;
        let pose: Pose = payload
            .trim()
            .parse()
            .map_err(|e| LimoError::protocol(channel, message, e))?;

        if !self.registry.update_position(robot_id, pose) {
            debug!(robot_id = %robot_id, "position before first heartbeat");
        }

        let frame = format!("{robot_id} {pose}");
        self.sinks.table(Topic::Position).fan_out(&frame);

        let id = robot_id.to_string();
        let value = pose.to_string();
        self.mirror("hset robots:pos", move |bus| {
            bus.hset(keys::ROBOT_POSITIONS, &id, &value)
        });
        Ok(())
    }

    fn on_map(&self, channel: &str, message: &str) -> Result<(), LimoError> {
        let (robot_id, body) =
            split_robot_id(message).map_err(|e| LimoError::protocol(channel, message, e))?;
        let diff = MapDiff::decode(body)
            .and_then(|diff| diff.quantized(&self.settings.quantizer))
            .map_err(|e| LimoError::protocol(channel, message, e))?;
        if diff.is_empty() {
            return Ok(());
        }
        debug!(robot_id = %robot_id, points = diff.len(), "map diff");

        let table = self.sinks.table(Topic::Map);
        for frame in diff.encode_chunks(self.settings.max_points_per_frame) {
            table.fan_out(&frame);
        }

        let fields: Vec<(String, String)> = diff
            .iter()
            .map(|point| (point.coord.to_string(), point.cell.as_char().to_string()))
            .collect();
        self.mirror("hset map", move |bus| bus.hset_many(keys::MAP, &fields));
        Ok(())
    }

    fn on_goal(&self, channel: &str, message: &str) -> Result<(), LimoError> {
        let update: GoalUpdate = message
            .trim()
            .parse()
            .map_err(|e| LimoError::protocol(channel, message, e))?;

        self.sinks.table(Topic::Goal).fan_out(&update.to_string());

        if !self.registry.set_goal(&update.robot_id, update.goal) {
            debug!(robot_id = %update.robot_id, "goal for robot without heartbeat");
        }
        let payload = update.payload();
        let id = update.robot_id;
        match update.goal {
            Some(_) => self.mirror("hset robots:goals", move |bus| {
                bus.hset(keys::ROBOT_GOALS, &id, &payload)
            }),
            None => self.mirror("hdel robots:goals", move |bus| {
                bus.hdel(keys::ROBOT_GOALS, &id)
            }),
        }
        Ok(())
    }

    // ── Sweep ───────────────────────────────────────────────────────────────

    /// Evict robots silent for longer than the keep-alive timeout as of `now`.
    ///
    /// Each evicted robot produces a `"<id> remove"` tombstone on the position
    /// and goal topics and loses its mirrored entries.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> Vec<Evicted> {
        let evicted = self.registry.sweep(now);
        for robot in &evicted {
            info!(
                robot_id = %robot.robot_id,
                last_heartbeat_at = %robot.last_heartbeat_at,
                "robot disconnected"
            );
            let tombstone = GoalUpdate::remove(robot.robot_id.as_str()).to_string();
            self.sinks.table(Topic::Position).fan_out(&tombstone);
            self.sinks.table(Topic::Goal).fan_out(&tombstone);

            let id = robot.robot_id.clone();
            self.mirror("evict", move |bus| {
                bus.hdel(keys::ROBOT_POSITIONS, &id)?;
                bus.hdel(keys::ROBOT_GOALS, &id)?;
                bus.srem(keys::ROBOTS, &id)
            });
        }
        evicted
    }

    /// Run [`sweep_once`][Self::sweep_once] every `interval` until `cancel`
    /// fires.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let router = self.this.clone();
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(router) = router.upgrade() else { break };
                        router.sweep_once(Utc::now());
                    }
                }
            }
            debug!("sweeper stopped");
        })
    }

    // ── Mirroring ───────────────────────────────────────────────────────────

    fn mirror<F>(&self, op: &'static str, write: F)
    where
        F: FnOnce(&dyn MessageBus) -> Result<(), LimoError> + Send + 'static,
    {
        match self.mirror_tx.try_send((op, Box::new(write))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(op, "mirror queue full, write dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(op, "mirror worker stopped, write dropped");
            }
        }
    }
}

/// Apply queued mirror writes one at a time until every sender is gone.
fn run_mirror_worker(
    bus: Arc<dyn MessageBus>,
    mut writes: mpsc::Receiver<(&'static str, MirrorWrite)>,
) {
    while let Some((op, write)) = writes.blocking_recv() {
        if let Err(e) = write(bus.as_ref()) {
            warn!(op, error = %e, "mirror write failed");
        }
    }
    debug!("mirror worker stopped");
}
