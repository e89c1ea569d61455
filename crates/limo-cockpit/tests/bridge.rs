//! End-to-end tests: robots publish on an in-process bus, consoles talk to a
//! real server over WebSockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use limo_cockpit::CockpitServer;
use limo_kernel::RobotRegistry;
use limo_middleware::{MemoryBus, MessageBus, RouterSettings, Sinks, UpdateRouter};
use limo_perception::{CellType, GridCoord, MapDiff};
use limo_types::{channels, keys};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

type Console = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Fleet {
    addr: SocketAddr,
    bus: Arc<MemoryBus>,
    router: Arc<UpdateRouter>,
    cancel: CancellationToken,
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_fleet(keep_alive: Duration) -> Fleet {
    let cancel = CancellationToken::new();
    let bus = Arc::new(MemoryBus::new());
    let router = UpdateRouter::new(
        Arc::new(RobotRegistry::with_root_token(keep_alive, cancel.child_token())),
        Arc::new(Sinks::default()),
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        RouterSettings::default(),
    )
    .unwrap();
    router.start(cancel.child_token()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(CockpitServer::new(&router).serve(listener, cancel.child_token()));

    Fleet {
        addr,
        bus,
        router,
        cancel,
    }
}

async fn console(fleet: &Fleet, path: &str) -> Console {
    let (ws, _) = connect_async(format!("ws://{}{path}", fleet.addr))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Console, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

async fn recv(ws: &mut Console) -> String {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame within 2s")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = msg {
            return text.as_str().to_string();
        }
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut response = String::new();
    timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn liveness_endpoints_answer() {
    let fleet = start_fleet(Duration::from_secs(10)).await;

    let response = http_get(fleet.addr, "/api/test").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("Hello World!"));

    let response = http_get(fleet.addr, "/api/health").await;
    assert!(response.starts_with("HTTP/1.1 200"));

    let response = http_get(fleet.addr, "/index.html").await;
    assert!(response.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn own_goal_is_not_echoed_but_reaches_other_consoles() {
    let fleet = start_fleet(Duration::from_secs(10)).await;
    fleet.bus.publish(channels::GENERAL, "r1 keep_alive").unwrap();

    let mut sender = console(&fleet, "/ws/update-goal").await;
    let mut other = console(&fleet, "/ws/update-goal").await;

    send(&mut sender, "r1 1.0,2.0").await;
    assert_eq!(recv(&mut other).await, "r1 1.0,2.0");

    // A goal from elsewhere is the next thing the sender sees; its own echo
    // would have been queued before it.
    fleet.bus.publish(channels::UPDATE_GOAL, "r1 3.0,4.0").unwrap();
    assert_eq!(recv(&mut sender).await, "r1 3.0,4.0");
    assert_eq!(recv(&mut other).await, "r1 3.0,4.0");

    assert!(
        fleet
            .bus
            .published()
            .contains(&(channels::UPDATE_GOAL.to_string(), "r1 1.0,2.0".to_string()))
    );
}

#[tokio::test]
async fn invalid_goal_instruction_keeps_connection_open() {
    let fleet = start_fleet(Duration::from_secs(10)).await;
    let mut sender = console(&fleet, "/ws/update-goal").await;
    let mut other = console(&fleet, "/ws/update-goal").await;

    send(&mut sender, "r1 somewhere").await;
    send(&mut sender, "r1 remove").await;
    assert_eq!(recv(&mut other).await, "r1 remove");
}

#[tokio::test]
async fn positions_stream_until_tombstone() {
    let fleet = start_fleet(Duration::from_secs(1)).await;
    let mut pos = console(&fleet, "/ws/robot-pos").await;

    fleet.bus.publish(channels::GENERAL, "r1 keep_alive").unwrap();
    fleet
        .bus
        .publish(channels::UPDATE_POS, "r1 1.5,2.5,0.0")
        .unwrap();
    assert_eq!(recv(&mut pos).await, "r1 1.5,2.5,0.0");

    send(&mut pos, "sendall").await;
    assert_eq!(recv(&mut pos).await, "r1 1.5,2.5,0.0");

    fleet
        .router
        .sweep_once(chrono::Utc::now() + chrono::Duration::seconds(5));
    assert_eq!(recv(&mut pos).await, "r1 remove");
    assert!(!fleet.router.registry().contains("r1"));
}

#[tokio::test]
async fn map_sendall_replays_mirrored_cells() {
    let fleet = start_fleet(Duration::from_secs(10)).await;
    let mut live = console(&fleet, "/ws/update-map").await;

    fleet
        .bus
        .publish(channels::UPDATE_MAP, "r1 W1.0,1.0 U2.0,2.0")
        .unwrap();
    assert_eq!(recv(&mut live).await, "W1.0,1.0 U2.0,2.0");

    let bus = Arc::clone(&fleet.bus);
    eventually(|| bus.hgetall(keys::MAP).unwrap().len() == 2).await;

    let mut late = console(&fleet, "/ws/update-map").await;
    send(&mut late, "sendall").await;
    let snapshot = MapDiff::decode(&recv(&mut late).await).unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(
        snapshot.get(&GridCoord::new_2d(1.0, 1.0)),
        Some(CellType::Wall)
    );
    assert_eq!(
        snapshot.get(&GridCoord::new_2d(2.0, 2.0)),
        Some(CellType::Unknown)
    );
}

#[tokio::test]
async fn goal_sendall_replays_mirrored_goals() {
    let fleet = start_fleet(Duration::from_secs(10)).await;
    fleet.bus.publish(channels::GENERAL, "r1 keep_alive").unwrap();
    fleet.bus.publish(channels::UPDATE_GOAL, "r1 5.0,6.0").unwrap();

    let bus = Arc::clone(&fleet.bus);
    eventually(|| !bus.hgetall(keys::ROBOT_GOALS).unwrap().is_empty()).await;

    let mut goals = console(&fleet, "/ws/update-goal").await;
    send(&mut goals, "sendall").await;
    assert_eq!(recv(&mut goals).await, "r1 5.0,6.0");
}

#[tokio::test]
async fn unknown_websocket_path_is_refused() {
    let fleet = start_fleet(Duration::from_secs(10)).await;
    let result = connect_async(format!("ws://{}/ws/unknown", fleet.addr)).await;
    assert!(result.is_err());
}
