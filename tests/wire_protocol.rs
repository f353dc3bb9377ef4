use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::assert_ok;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use slotbook::engine::Engine;
use slotbook::notify::NotifyHub;
use slotbook::wire;

/// 2025-07-03T00:00:00Z
const DAY: i64 = 1_751_500_800_000;
const H: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("slotbook.wal"), Arc::new(NotifyHub::new())).unwrap());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    addr
}

/// Line-oriented client that sets pushed notifications aside.
struct Client {
    framed: Framed<TcpStream, LinesCodec>,
    notifications: VecDeque<Value>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
            notifications: VecDeque::new(),
        }
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.framed.send(line.to_string()).await.unwrap();
        loop {
            let line = self.framed.next().await.expect("server closed").unwrap();
            let v: Value = serde_json::from_str(&line).unwrap();
            if v.get("notify").is_some() {
                self.notifications.push_back(v);
            } else {
                return v;
            }
        }
    }

    async fn call(&mut self, req: Value) -> Value {
        self.send_raw(&req.to_string()).await
    }

    /// Unwraps a successful response's `data`.
    async fn ok(&mut self, req: Value) -> Value {
        let resp = self.call(req).await;
        assert_eq!(resp["ok"], true, "expected success, got {resp}");
        resp["data"].clone()
    }

    async fn next_notification(&mut self, timeout: Duration) -> Option<Value> {
        if let Some(n) = self.notifications.pop_front() {
            return Some(n);
        }
        let line = tokio::time::timeout(timeout, self.framed.next()).await.ok()??;
        serde_json::from_str(&line.ok()?).ok()
    }
}

async fn create_studio(client: &mut Client, name: &str, rate: f64) -> String {
    let studio = client
        .ok(json!({ "op": "create_studio", "name": name, "hourlyRate": rate }))
        .await;
    studio["id"].as_str().unwrap().to_string()
}

fn booking_req(studio_id: &str, start: i64, end: i64) -> Value {
    json!({
        "op": "create_booking",
        "studioId": studio_id,
        "clientId": Ulid::new().to_string(),
        "start": start,
        "end": end,
    })
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_fetch_booking() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let sid = create_studio(&mut client, "Live Room", 50.0).await;

    let booking = client
        .ok(booking_req(&sid, DAY + 10 * H, DAY + 13 * H + 30 * 60_000))
        .await;
    assert_eq!(booking["status"], "pending");
    assert_eq!(booking["totalPrice"], 175.0);
    assert_eq!(booking["isPaid"], false);
    assert_eq!(booking["startTime"], DAY + 10 * H);
    assert_eq!(booking["endTime"], DAY + 13 * H + 30 * 60_000);

    let id = booking["id"].as_str().unwrap();
    let fetched = client.ok(json!({ "op": "get_booking", "id": id })).await;
    assert_eq!(fetched, booking);
}

#[tokio::test]
async fn conflict_is_reported_with_code() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let sid = create_studio(&mut client, "A", 40.0).await;

    client.ok(booking_req(&sid, DAY + 10 * H, DAY + 12 * H)).await;
    let resp = client.call(booking_req(&sid, DAY + 11 * H, DAY + 13 * H)).await;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["code"], 400);
    assert!(resp["error"].as_str().unwrap().contains("conflicting booking"));

    // Adjacent is fine
    client.ok(booking_req(&sid, DAY + 12 * H, DAY + 13 * H)).await;

    let check = client
        .ok(json!({ "op": "has_conflict", "studioId": sid, "start": DAY + 9 * H, "end": DAY + 10 * H + 1 }))
        .await;
    assert_eq!(check["conflict"], true);
}

#[tokio::test]
async fn lifecycle_over_the_wire() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let sid = create_studio(&mut client, "A", 40.0).await;
    let booking = client.ok(booking_req(&sid, DAY + 10 * H, DAY + 12 * H)).await;
    let id = booking["id"].as_str().unwrap().to_string();

    let confirmed = client
        .ok(json!({ "op": "update_booking", "id": id, "status": "confirmed", "notes": "mix session" }))
        .await;
    assert_eq!(confirmed["status"], "confirmed");
    assert_eq!(confirmed["notes"], "mix session");

    let paid = client.ok(json!({ "op": "mark_paid", "id": id })).await;
    assert_eq!(paid["isPaid"], true);

    let cancelled = client
        .ok(json!({ "op": "cancel_booking", "id": id, "reason": "illness" }))
        .await;
    assert_eq!(cancelled["status"], "cancelled");
    assert_eq!(cancelled["cancelledReason"], "illness");

    let again = client.call(json!({ "op": "cancel_booking", "id": id })).await;
    assert_eq!(again["error"], "cannot cancel a cancelled booking");
}

#[tokio::test]
async fn availability_and_listing() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let sid = create_studio(&mut client, "A", 40.0).await;
    client.ok(booking_req(&sid, DAY + 10 * H, DAY + 12 * H)).await;

    let report = client
        .ok(json!({ "op": "availability", "studioId": sid, "date": "2025-07-03" }))
        .await;
    assert_eq!(report["availableSlots"].as_array().unwrap().len(), 11);
    assert_eq!(report["bookedSlots"].as_array().unwrap().len(), 2);
    assert_eq!(report["openingHour"], 9);

    let listed = client
        .ok(json!({ "op": "list_bookings", "studioId": sid, "status": "pending" }))
        .await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let calendar = client
        .ok(json!({ "op": "calendar", "from": DAY, "to": DAY + 24 * H }))
        .await;
    assert_eq!(calendar.as_array().unwrap().len(), 1);

    let quote = client
        .ok(json!({ "op": "quote", "studioId": sid, "start": DAY, "end": DAY + 90 * 60_000 }))
        .await;
    assert_eq!(quote["price"], 60.0);

    let studios = client.ok(json!({ "op": "list_studios" })).await;
    assert_eq!(studios.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_requests_get_400() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let resp = client.send_raw("not json").await;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["code"], 400);

    let resp = client.call(json!({ "op": "explode" })).await;
    assert_eq!(resp["code"], 400);

    let resp = client
        .call(json!({ "op": "get_studio", "id": Ulid::new().to_string() }))
        .await;
    assert_eq!(resp["code"], 404);

    for (from, to) in [(i64::MIN, i64::MIN), (-1, i64::MAX), (i64::MIN, i64::MAX)] {
        let resp = client.call(json!({ "op": "calendar", "from": from, "to": to })).await;
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["code"], 400);
    }

    // Connection survives errors
    let studios = client.ok(json!({ "op": "list_studios" })).await;
    assert!(studios.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn listen_receives_studio_events() {
    let addr = start_test_server().await;
    let mut listener = Client::connect(addr).await;
    let mut writer = Client::connect(addr).await;

    let watched = create_studio(&mut writer, "Watched", 40.0).await;
    let other = create_studio(&mut writer, "Other", 40.0).await;

    let ack = listener.ok(json!({ "op": "listen", "studioId": watched })).await;
    assert_eq!(ack["listening"], watched.as_str());

    writer.ok(booking_req(&other, DAY + 10 * H, DAY + 11 * H)).await;
    assert!(
        listener.next_notification(Duration::from_millis(300)).await.is_none(),
        "should not receive events for an unwatched studio"
    );

    let booking = writer.ok(booking_req(&watched, DAY + 10 * H, DAY + 11 * H)).await;
    let notif = listener
        .next_notification(Duration::from_secs(5))
        .await
        .expect("expected notification");
    assert_eq!(notif["notify"]["studioId"], watched.as_str());
    assert_eq!(notif["notify"]["event"]["booking_created"]["booking"]["id"], booking["id"]);

    let unlisten = listener.ok(json!({ "op": "unlisten" })).await;
    assert_eq!(unlisten["unlistened"], 1);
    writer.ok(booking_req(&watched, DAY + 12 * H, DAY + 13 * H)).await;
    assert!(listener.next_notification(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn listen_unknown_studio_fails() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let resp = client
        .call(json!({ "op": "listen", "studioId": Ulid::new().to_string() }))
        .await;
    assert_eq!(resp["code"], 404);
}

#[tokio::test]
async fn concurrent_clients_single_winner() {
    let addr = start_test_server().await;
    let mut setup = Client::connect(addr).await;
    let sid = create_studio(&mut setup, "Contended", 40.0).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let sid = sid.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client.call(booking_req(&sid, DAY + 10 * H, DAY + 11 * H)).await
        }));
    }

    let mut winners = 0;
    for h in handles {
        let resp = assert_ok!(h.await);
        if resp["ok"] == true {
            winners += 1;
        } else {
            assert_eq!(resp["code"], 400);
        }
    }
    assert_eq!(winners, 1);
}
