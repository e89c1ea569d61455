//! [`CockpitServer`] – HTTP + WebSocket bridge for fleet consoles.
//!
//! Listens on `0.0.0.0:8080` by default.
//!
//! * `GET /api/test` → `200 Hello World!`, `GET /api/health` → `200 ok`.
//! * WebSocket upgrades on a [`Topic`] path → console bridge for that topic.
//! * Anything else → `404`.
//!
//! A console connection registers a sink for its topic and streams every
//! frame fanned out to it.  The text frame `"sendall"` asks for a snapshot of
//! the topic's current state; on the goal topic any other frame is a goal
//! instruction `"<robotId> <x>,<y>"` or `"<robotId> remove"`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use limo_kernel::RobotRegistry;
use limo_middleware::{DEFAULT_MAX_POINTS_PER_FRAME, MessageBus, Sinks, UpdateRouter};
use limo_perception::{CellType, GridCoord, MapDiff};
use limo_types::{GoalUpdate, LimoError, Topic, channels, keys};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::echo::{DEFAULT_ECHO_TTL, EchoFilter};

/// Default TCP port for the HTTP/WebSocket server.
pub const DEFAULT_PORT: u16 = 8080;

/// Text frame requesting a full snapshot of the connection's topic.
pub const SENDALL: &str = "sendall";

/// Request paths answered over plain HTTP.
pub const TEST_PATH: &str = "/api/test";
pub const HEALTH_PATH: &str = "/api/health";

/// Behaviour knobs of the console bridge.
#[derive(Debug, Clone)]
pub struct CockpitSettings {
    /// Upper bound of map points per snapshot frame.
    pub max_points_per_frame: usize,
    /// Lifetime of a goal-echo suppression entry.
    pub echo_ttl: Duration,
}

impl Default for CockpitSettings {
    fn default() -> Self {
        Self {
            max_points_per_frame: DEFAULT_MAX_POINTS_PER_FRAME,
            echo_ttl: DEFAULT_ECHO_TTL,
        }
    }
}

/// State shared by every connection.
struct Shared {
    registry: Arc<RobotRegistry>,
    sinks: Arc<Sinks>,
    bus: Arc<dyn MessageBus>,
    settings: CockpitSettings,
}

// ────────────────────────────────────────────────────────────────────────────
// CockpitServer
// ────────────────────────────────────────────────────────────────────────────

/// Console-facing HTTP + WebSocket server.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use limo_cockpit::CockpitServer;
/// use limo_kernel::RobotRegistry;
/// use limo_middleware::{MemoryBus, MessageBus, RouterSettings, Sinks, UpdateRouter};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
///     let router = UpdateRouter::new(
///         Arc::new(RobotRegistry::default()),
///         Arc::new(Sinks::default()),
///         bus,
///         RouterSettings::default(),
///     )
///     .expect("inside a runtime");
///     CockpitServer::new(&router)
///         .run(CancellationToken::new())
///         .await
///         .expect("cockpit server failed");
/// }
/// ```
pub struct CockpitServer {
    shared: Arc<Shared>,
    host: String,
    port: u16,
}

impl CockpitServer {
    /// Create a server over the router's registry, sinks and bus, on
    /// `0.0.0.0:`[`DEFAULT_PORT`].
    pub fn new(router: &UpdateRouter) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Arc::clone(router.registry()),
                sinks: Arc::clone(router.sinks()),
                bus: Arc::clone(router.bus()),
                settings: CockpitSettings::default(),
            }),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_settings(mut self, settings: CockpitSettings) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.settings = settings;
        }
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind the configured address and serve until `cancel` fires.
    ///
    /// # Errors
    ///
    /// [`LimoError::Io`] if the listener cannot bind.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), LimoError> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| LimoError::Io(format!("bind error on {addr}: {e}")))?;
        info!(addr = %addr, "cockpit listening");
        self.serve(listener, cancel).await;
        Ok(())
    }

    /// Accept connections on an already bound `listener` until `cancel`
    /// fires.  Open connections are closed on cancel as well.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = Arc::clone(&self.shared);
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, shared, cancel).await {
                                warn!(peer = %peer, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept error"),
                }
            }
        }
        info!("cockpit stopped");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Request routing
// ────────────────────────────────────────────────────────────────────────────

/// What the first bytes of a connection ask for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestHead {
    pub path: String,
    pub websocket: bool,
}

/// Extract the request path and upgrade intent from a request preview.
pub(crate) fn parse_request_head(preview: &str) -> Option<RequestHead> {
    let mut lines = preview.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let _method = request_line.next()?;
    let path = request_line.next()?.to_string();
    let websocket = lines.any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    });
    Some(RequestHead { path, websocket })
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) -> Result<(), LimoError> {
    // `peek` leaves the bytes in place for the WebSocket handshake.
    let mut buf = [0u8; 2048];
    let n = stream
        .peek(&mut buf)
        .await
        .map_err(|e| LimoError::Io(format!("peek error from {peer}: {e}")))?;
    if n == 0 {
        return Ok(());
    }

    let preview = String::from_utf8_lossy(&buf[..n]);
    let Some(head) = parse_request_head(&preview) else {
        return respond(stream, 400, "Bad Request", "bad request").await;
    };

    match (head.websocket, Topic::from_ws_path(&head.path)) {
        (true, Some(topic)) => handle_ws(stream, peer, topic, shared, cancel).await,
        (true, None) => respond(stream, 404, "Not Found", "not found").await,
        (false, _) => {
            let path = head.path.split('?').next().unwrap_or_default();
            match path {
                TEST_PATH => respond(stream, 200, "OK", "Hello World!").await,
                HEALTH_PATH => respond(stream, 200, "OK", "ok").await,
                _ => respond(stream, 404, "Not Found", "not found").await,
            }
        }
    }
}

/// Consume the request and write a plain-text response.
async fn respond(
    mut stream: TcpStream,
    status: u16,
    reason: &str,
    body: &str,
) -> Result<(), LimoError> {
    let mut buf = [0u8; 2048];
    let _ = stream.read(&mut buf).await;

    let response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| LimoError::Io(format!("HTTP write error: {e}")))?;
    let _ = stream.shutdown().await;
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// WebSocket: topic bridge
// ────────────────────────────────────────────────────────────────────────────

async fn handle_ws(
    stream: TcpStream,
    peer: SocketAddr,
    topic: Topic,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) -> Result<(), LimoError> {
    // The sink exists before the handshake completes, so a client that sees
    // the upgrade response is guaranteed to get every later frame.
    let table = shared.sinks.table(topic);
    let (sink_id, mut frames) = table.register();

    let result = bridge(stream, peer, topic, &shared, &mut frames, cancel).await;

    table.unregister(sink_id);
    info!(peer = %peer, topic = %topic, "console disconnected");
    result
}

async fn bridge(
    stream: TcpStream,
    peer: SocketAddr,
    topic: Topic,
    shared: &Arc<Shared>,
    frames: &mut tokio::sync::mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> Result<(), LimoError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| LimoError::Io(format!("WS handshake from {peer}: {e}")))?;
    info!(peer = %peer, topic = %topic, "console connected");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let mut echoes = EchoFilter::new(shared.settings.echo_ttl);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }
            // ── Downstream: fan-out → console ──────────────────────────────
            frame = frames.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                if topic == Topic::Goal && echoes.suppress(&frame) {
                    debug!(peer = %peer, frame = %frame, "own goal echo suppressed");
                    continue;
                }
                ws_tx
                    .send(Message::Text(frame.into()))
                    .await
                    .map_err(|e| LimoError::Io(format!("WS send to {peer}: {e}")))?;
            }
            // ── Upstream: console → server ─────────────────────────────────
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let text = text.as_str().trim();
                    if text == SENDALL {
                        let replay = match snapshot(shared, topic).await {
                            Ok(replay) => replay,
                            Err(e) => {
                                warn!(peer = %peer, topic = %topic, error = %e, "snapshot failed");
                                continue;
                            }
                        };
                        debug!(peer = %peer, topic = %topic, frames = replay.len(), "sendall");
                        for frame in replay {
                            ws_tx
                                .send(Message::Text(frame.into()))
                                .await
                                .map_err(|e| LimoError::Io(format!("WS send to {peer}: {e}")))?;
                        }
                    } else if topic == Topic::Goal {
                        submit_goal(shared, &mut echoes, peer, text).await;
                    } else {
                        debug!(peer = %peer, topic = %topic, "ignoring console frame");
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(LimoError::Io(format!("WS read from {peer}: {e}"))),
                _ => {}
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Goal instructions
// ────────────────────────────────────────────────────────────────────────────

/// Validate a console goal instruction.
///
/// # Errors
///
/// [`LimoError::Validation`] when the text is not `"<robotId> <x>,<y>"` or
/// `"<robotId> remove"`.
pub fn parse_goal_instruction(text: &str) -> Result<GoalUpdate, LimoError> {
    text.trim()
        .parse::<GoalUpdate>()
        .map_err(|e| LimoError::validation(text, e))
}

/// Publish a console goal on the bus, remembering it so its echo is not
/// sent back to the same console.
async fn submit_goal(shared: &Arc<Shared>, echoes: &mut EchoFilter, peer: SocketAddr, text: &str) {
    let update = match parse_goal_instruction(text) {
        Ok(update) => update,
        Err(e) => {
            warn!(peer = %peer, error = %e, "goal instruction rejected");
            return;
        }
    };

    let frame = update.to_string();
    echoes.record(&frame);

    let bus = Arc::clone(&shared.bus);
    let message = frame.clone();
    let published = tokio::task::spawn_blocking(move || bus.publish(channels::UPDATE_GOAL, &message))
        .await
        .unwrap_or_else(|e| Err(LimoError::Io(format!("publish task failed: {e}"))));
    match published {
        Ok(()) => info!(peer = %peer, goal = %frame, "goal submitted"),
        Err(e) => warn!(peer = %peer, goal = %frame, error = %e, "goal publish failed"),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Snapshots
// ────────────────────────────────────────────────────────────────────────────

/// Frames describing the full current state of `topic`.
async fn snapshot(shared: &Arc<Shared>, topic: Topic) -> Result<Vec<String>, LimoError> {
    match topic {
        Topic::Position => Ok(position_frames(&shared.registry)),
        Topic::Map => {
            let cells = read_hash(shared, keys::MAP).await?;
            Ok(map_frames(&cells, shared.settings.max_points_per_frame))
        }
        Topic::Goal => {
            let goals = read_hash(shared, keys::ROBOT_GOALS).await?;
            Ok(goal_frames(&goals))
        }
    }
}

async fn read_hash(shared: &Arc<Shared>, key: &'static str) -> Result<HashMap<String, String>, LimoError> {
    let bus = Arc::clone(&shared.bus);
    tokio::task::spawn_blocking(move || bus.hgetall(key))
        .await
        .unwrap_or_else(|e| Err(LimoError::Io(format!("snapshot task failed: {e}"))))
}

/// `"<id> x,y,angle"` for every live robot with a known position.
pub(crate) fn position_frames(registry: &RobotRegistry) -> Vec<String> {
    registry
        .snapshot()
        .into_iter()
        .filter_map(|robot| {
            robot
                .last_position
                .map(|pose| format!("{} {pose}", robot.id))
        })
        .collect()
}

/// Rebuild the mirrored map hash into diff bodies of bounded size.
///
/// Fields that do not parse are skipped.
pub(crate) fn map_frames(cells: &HashMap<String, String>, max_points: usize) -> Vec<String> {
    let mut diff = MapDiff::new();
    for (coord, cell) in cells {
        let parsed = coord
            .parse::<GridCoord>()
            .ok()
            .zip(cell.chars().next().and_then(CellType::from_char));
        match parsed {
            Some((coord, cell)) => diff.insert(coord, cell),
            None => warn!(coord = %coord, cell = %cell, "skipping malformed map entry"),
        }
    }
    if diff.is_empty() {
        return Vec::new();
    }
    diff.encode_chunks(max_points)
}

/// `"<id> x,y"` for every mirrored goal, ordered by robot id.
pub(crate) fn goal_frames(goals: &HashMap<String, String>) -> Vec<String> {
    let mut frames: Vec<String> = goals
        .iter()
        .map(|(robot_id, goal)| format!("{robot_id} {goal}"))
        .collect();
    frames.sort();
    frames
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use limo_middleware::{MemoryBus, RouterSettings};
    use limo_types::{Goal, Pose};

    fn make_router() -> Arc<UpdateRouter> {
        UpdateRouter::new(
            Arc::new(RobotRegistry::default()),
            Arc::new(Sinks::default()),
            Arc::new(MemoryBus::new()),
            RouterSettings::default(),
        )
        .unwrap()
    }

    // ── CockpitServer constructor ─────────────────────────────────────────────

    #[tokio::test]
    async fn default_port_is_8080() {
        let server = CockpitServer::new(&make_router());
        assert_eq!(server.port(), DEFAULT_PORT);
        assert_eq!(server.host(), "0.0.0.0");
    }

    #[tokio::test]
    async fn builders_override_defaults() {
        let server = CockpitServer::new(&make_router())
            .with_host("127.0.0.1")
            .with_port(9999)
            .with_settings(CockpitSettings {
                max_points_per_frame: 10,
                echo_ttl: Duration::from_secs(1),
            });
        assert_eq!(server.port(), 9999);
        assert_eq!(server.host(), "127.0.0.1");
        assert_eq!(server.shared.settings.max_points_per_frame, 10);
    }

    // ── Request routing ───────────────────────────────────────────────────────

    #[test]
    fn request_head_detects_upgrade() {
        let head = parse_request_head(
            "GET /ws/robot-pos HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.path, "/ws/robot-pos");
        assert!(head.websocket);

        let head = parse_request_head("GET /api/test HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(head.path, "/api/test");
        assert!(!head.websocket);

        assert!(parse_request_head("").is_none());
        assert!(parse_request_head("GET").is_none());
    }

    // ── Goal instructions ─────────────────────────────────────────────────────

    #[test]
    fn goal_instruction_accepts_set_and_remove() {
        assert_eq!(
            parse_goal_instruction("r1 1.0,2.0").unwrap(),
            GoalUpdate::set("r1", Goal::new(1.0, 2.0))
        );
        assert_eq!(
            parse_goal_instruction(" r1 remove\n").unwrap(),
            GoalUpdate::remove("r1")
        );
    }

    #[test]
    fn goal_instruction_rejects_malformed_text() {
        for text in ["r1", "r1 1.0", "r1 north,south", "", "r1 1.0,2.0,3.0"] {
            assert!(
                matches!(
                    parse_goal_instruction(text),
                    Err(LimoError::Validation { .. })
                ),
                "{text:?} should be rejected"
            );
        }
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    #[test]
    fn position_frames_skip_robots_without_position() {
        let registry = RobotRegistry::default();
        registry.heartbeat("r2", Utc::now());
        registry.heartbeat("r1", Utc::now());
        registry.update_position("r1", Pose::new(1.5, 2.5, 0.0));
        assert_eq!(position_frames(&registry), vec!["r1 1.5,2.5,0.0"]);
    }

    #[test]
    fn map_frames_rebuild_typed_tokens() {
        let cells: HashMap<String, String> = [
            ("1.0,1.0".to_string(), "W".to_string()),
            ("2.0,2.0".to_string(), "U".to_string()),
            ("bogus".to_string(), "P".to_string()),
            ("3.0,3.0".to_string(), "Z".to_string()),
        ]
        .into_iter()
        .collect();
        let frames = map_frames(&cells, 20_000);
        assert_eq!(frames.len(), 1);
        let diff = MapDiff::decode(&frames[0]).unwrap();
        assert_eq!(diff.len(), 2);
        assert_eq!(
            diff.get(&GridCoord::new_2d(1.0, 1.0)),
            Some(CellType::Wall)
        );
    }

    #[test]
    fn map_frames_are_chunked() {
        let cells: HashMap<String, String> = (0..50)
            .map(|i| (format!("{i}.5,0.0"), "P".to_string()))
            .collect();
        let frames = map_frames(&cells, 20);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.split(' ').count() <= 20));
    }

    #[test]
    fn empty_map_has_no_frames() {
        assert!(map_frames(&HashMap::new(), 20_000).is_empty());
    }

    #[test]
    fn goal_frames_are_ordered() {
        let goals: HashMap<String, String> = [
            ("r2".to_string(), "3.0,4.0".to_string()),
            ("r1".to_string(), "1.0,2.0".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(goal_frames(&goals), vec!["r1 1.0,2.0", "r2 3.0,4.0"]);
    }
}
