use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use wavehub::app::auth::AuthValidator;
use wavehub::app::config::App;
use wavehub::app::memory_manager::MemoryAppManager;
use wavehub::handler::ConnectionHandler;
use wavehub::hub::Hub;
use wavehub::metrics::Metrics;
use wavehub::options::ServerOptions;
use wavehub::websocket::{ConnectionHandle, ConnectionState, OutboundFrame};

fn test_app() -> App {
    App {
        id: "app1".into(),
        key: "app1-key".into(),
        secret: "app1-secret".into(),
        ..Default::default()
    }
}

fn test_handler(options: ServerOptions) -> Arc<ConnectionHandler> {
    let metrics = Arc::new(Metrics::new().unwrap());
    let app_manager = Arc::new(MemoryAppManager::new(vec![test_app()]));
    let hub = Arc::new(Hub::new(options.max_connections, metrics.clone()));
    Arc::new(ConnectionHandler::new(app_manager, hub, metrics, options))
}

fn connect(
    handler: &Arc<ConnectionHandler>,
    app: &App,
) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundFrame>) {
    let (conn, rx) = ConnectionHandle::new(
        wavehub::websocket::SocketId::generate(),
        app.key.clone(),
        app.id.clone(),
        &handler.options,
    );
    let conn = Arc::new(conn);
    handler.hub.attach(conn.clone(), app).unwrap();
    conn.set_state(ConnectionState::Established);
    (conn, rx)
}

/// Drain every queued protocol frame, parsed as JSON.
fn drain(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let OutboundFrame::Message(bytes) = frame {
            frames.push(serde_json::from_slice(&bytes).unwrap());
        }
    }
    frames
}

fn subscribe_frame(channel: &str) -> String {
    json!({"event": "pusher:subscribe", "data": {"channel": channel}}).to_string()
}

fn signed_subscribe_frame(
    app: &App,
    conn: &ConnectionHandle,
    channel: &str,
    channel_data: Option<&str>,
) -> String {
    let auth = AuthValidator::sign_channel_auth(app, &conn.socket_id, channel, channel_data);
    let mut data = json!({"channel": channel, "auth": auth});
    if let Some(channel_data) = channel_data {
        data["channel_data"] = json!(channel_data);
    }
    json!({"event": "pusher:subscribe", "data": data}).to_string()
}

fn presence_data(frame: &Value) -> Value {
    let inner: Value = serde_json::from_str(frame["data"].as_str().unwrap()).unwrap();
    inner["presence"].clone()
}

#[tokio::test]
async fn public_subscribe_is_acknowledged() {
    let app = test_app();
    let handler = test_handler(ServerOptions::default());
    let (conn, mut rx) = connect(&handler, &app);

    handler
        .handle_frame(&conn, &app, &subscribe_frame("chat"))
        .await
        .unwrap();

    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["event"], "pusher_internal:subscription_succeeded");
    assert_eq!(frames[0]["channel"], "chat");
    assert_eq!(frames[0]["data"], "{}");

    let namespace = handler.hub.namespace(&app.key);
    assert!(namespace.channels.is_subscribed("chat", &conn.socket_id));
    assert_eq!(handler.hub.channel_count(), 1);
}

#[tokio::test]
async fn resubscribe_is_idempotent_but_still_acknowledged() {
    let app = test_app();
    let handler = test_handler(ServerOptions::default());
    let (conn, mut rx) = connect(&handler, &app);

    for _ in 0..2 {
        handler
            .handle_frame(&conn, &app, &subscribe_frame("chat"))
            .await
            .unwrap();
    }

    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 2);
    assert!(frames
        .iter()
        .all(|f| f["event"] == "pusher_internal:subscription_succeeded"));

    let namespace = handler.hub.namespace(&app.key);
    assert_eq!(namespace.channels.subscriber_count("chat"), 1);
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let app = test_app();
    let handler = test_handler(ServerOptions::default());
    let (conn, mut rx) = connect(&handler, &app);

    handler
        .handle_frame(&conn, &app, r#"{"event":"pusher:ping"}"#)
        .await
        .unwrap();

    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["event"], "pusher:pong");
}

#[tokio::test]
async fn private_subscribe_requires_valid_signature() {
    let app = test_app();
    let handler = test_handler(ServerOptions::default());
    let (conn, mut rx) = connect(&handler, &app);

    // No auth at all.
    handler
        .handle_frame(&conn, &app, &subscribe_frame("private-room"))
        .await
        .unwrap();
    let frames = drain(&mut rx);
    assert_eq!(frames[0]["event"], "pusher:error");
    assert_eq!(frames[0]["data"]["code"], 4101);

    // Tampered signature.
    let bad = json!({
        "event": "pusher:subscribe",
        "data": {"channel": "private-room", "auth": format!("{}:{}", app.key, "0".repeat(64))},
    })
    .to_string();
    handler.handle_frame(&conn, &app, &bad).await.unwrap();
    let frames = drain(&mut rx);
    assert_eq!(frames[0]["data"]["code"], 4101);

    let namespace = handler.hub.namespace(&app.key);
    assert!(!namespace.channels.is_subscribed("private-room", &conn.socket_id));
    assert_eq!(conn.state(), ConnectionState::Established);

    // Valid signature subscribes.
    let good = signed_subscribe_frame(&app, &conn, "private-room", None);
    handler.handle_frame(&conn, &app, &good).await.unwrap();
    let frames = drain(&mut rx);
    assert_eq!(frames[0]["event"], "pusher_internal:subscription_succeeded");
    assert!(namespace.channels.is_subscribed("private-room", &conn.socket_id));
}

#[tokio::test]
async fn presence_join_order_and_snapshots() {
    let app = test_app();
    let handler = test_handler(ServerOptions::default());
    let (conn_a, mut rx_a) = connect(&handler, &app);
    let (conn_b, mut rx_b) = connect(&handler, &app);

    // A joins first.
    let frame = signed_subscribe_frame(&app, &conn_a, "presence-room", Some(r#"{"user_id":"u1"}"#));
    handler.handle_frame(&conn_a, &app, &frame).await.unwrap();

    let frames = drain(&mut rx_a);
    assert_eq!(frames.len(), 1);
    let snapshot = presence_data(&frames[0]);
    assert_eq!(snapshot["ids"], json!(["u1"]));
    assert_eq!(snapshot["count"], 1);
    assert_eq!(snapshot["hash"], json!({}));

    // B joins second and sees both members; A hears about the join.
    let frame = signed_subscribe_frame(&app, &conn_b, "presence-room", Some(r#"{"user_id":"u2"}"#));
    handler.handle_frame(&conn_b, &app, &frame).await.unwrap();

    let frames_b = drain(&mut rx_b);
    assert_eq!(frames_b.len(), 1, "B must not receive its own member_added");
    let snapshot = presence_data(&frames_b[0]);
    assert_eq!(snapshot["ids"], json!(["u1", "u2"]));
    assert_eq!(snapshot["count"], 2);

    let frames_a = drain(&mut rx_a);
    assert_eq!(frames_a.len(), 1);
    assert_eq!(frames_a[0]["event"], "pusher_internal:member_added");
    let inner: Value = serde_json::from_str(frames_a[0]["data"].as_str().unwrap()).unwrap();
    assert_eq!(inner["user_id"], "u2");
}

#[tokio::test]
async fn distinct_user_presence_counts_and_removal() {
    let app = test_app();
    let handler = test_handler(ServerOptions::default());
    let (conn_a, mut rx_a) = connect(&handler, &app);
    let (conn_b, mut rx_b) = connect(&handler, &app);
    let (conn_c, mut rx_c) = connect(&handler, &app);

    // Two connections for u1, one observer u2.
    for conn in [&conn_a, &conn_b] {
        let frame =
            signed_subscribe_frame(&app, conn, "presence-room", Some(r#"{"user_id":"u1"}"#));
        handler.handle_frame(conn, &app, &frame).await.unwrap();
    }
    let frame = signed_subscribe_frame(&app, &conn_c, "presence-room", Some(r#"{"user_id":"u2"}"#));
    handler.handle_frame(&conn_c, &app, &frame).await.unwrap();

    // u1's second connection did not re-announce the user.
    let member_adds: Vec<Value> = drain(&mut rx_a)
        .into_iter()
        .filter(|f| f["event"] == "pusher_internal:member_added")
        .collect();
    assert_eq!(member_adds.len(), 1, "only u2's join is announced to A");

    let namespace = handler.hub.namespace(&app.key);
    assert_eq!(namespace.presence.presence_data("presence-room").count, 2);

    // First u1 connection leaves: no member_removed.
    handler.hub.detach(&conn_a.socket_id);
    drain(&mut rx_b);
    assert!(drain(&mut rx_c)
        .iter()
        .all(|f| f["event"] != "pusher_internal:member_removed"));

    // Last u1 connection leaves: member_removed reaches the observer.
    handler.hub.detach(&conn_b.socket_id);
    let frames = drain(&mut rx_c);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["event"], "pusher_internal:member_removed");
    let inner: Value = serde_json::from_str(frames[0]["data"].as_str().unwrap()).unwrap();
    assert_eq!(inner["user_id"], "u1");
}

#[tokio::test]
async fn unsubscribe_announces_departed_presence_member() {
    let app = test_app();
    let handler = test_handler(ServerOptions::default());
    let (conn_a, mut rx_a) = connect(&handler, &app);
    let (conn_b, mut rx_b) = connect(&handler, &app);

    let frame = signed_subscribe_frame(&app, &conn_a, "presence-room", Some(r#"{"user_id":"u1"}"#));
    handler.handle_frame(&conn_a, &app, &frame).await.unwrap();
    let frame = signed_subscribe_frame(&app, &conn_b, "presence-room", Some(r#"{"user_id":"u2"}"#));
    handler.handle_frame(&conn_b, &app, &frame).await.unwrap();
    drain(&mut rx_a);
    drain(&mut rx_b);

    let unsubscribe =
        json!({"event": "pusher:unsubscribe", "data": {"channel": "presence-room"}}).to_string();
    handler
        .handle_frame(&conn_a, &app, &unsubscribe)
        .await
        .unwrap();

    let frames = drain(&mut rx_b);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["event"], "pusher_internal:member_removed");

    let namespace = handler.hub.namespace(&app.key);
    assert_eq!(namespace.presence.presence_data("presence-room").count, 1);
    assert!(!namespace.channels.is_subscribed("presence-room", &conn_a.socket_id));
}

#[tokio::test]
async fn client_events_fan_out_to_co_subscribers_only() {
    let app = test_app();
    let handler = test_handler(ServerOptions::default());
    let (conn_a, mut rx_a) = connect(&handler, &app);
    let (conn_b, mut rx_b) = connect(&handler, &app);

    for (conn, rx) in [(&conn_a, &mut rx_a), (&conn_b, &mut rx_b)] {
        let frame = signed_subscribe_frame(&app, conn, "private-room", None);
        handler.handle_frame(conn, &app, &frame).await.unwrap();
        drain(rx);
    }

    let event = json!({
        "event": "client-typing",
        "channel": "private-room",
        "data": {"state": "typing"},
    })
    .to_string();
    handler.handle_frame(&conn_a, &app, &event).await.unwrap();

    // The sender never hears its own client event.
    assert!(drain(&mut rx_a).is_empty());

    let frames = drain(&mut rx_b);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["event"], "client-typing");
    assert_eq!(frames[0]["channel"], "private-room");
    let inner: Value = serde_json::from_str(frames[0]["data"].as_str().unwrap()).unwrap();
    assert_eq!(inner, json!({"state": "typing"}));
}

#[tokio::test]
async fn client_events_rejected_on_public_or_unsubscribed_channels() {
    let app = test_app();
    let handler = test_handler(ServerOptions::default());
    let (conn, mut rx) = connect(&handler, &app);

    handler
        .handle_frame(&conn, &app, &subscribe_frame("chat"))
        .await
        .unwrap();
    drain(&mut rx);

    // Public channel.
    let event = json!({"event": "client-x", "channel": "chat", "data": "{}"}).to_string();
    handler.handle_frame(&conn, &app, &event).await.unwrap();
    let frames = drain(&mut rx);
    assert_eq!(frames[0]["event"], "pusher:error");

    // Not subscribed.
    let event = json!({"event": "client-x", "channel": "private-room", "data": "{}"}).to_string();
    handler.handle_frame(&conn, &app, &event).await.unwrap();
    let frames = drain(&mut rx);
    assert_eq!(frames[0]["event"], "pusher:error");
}

#[tokio::test]
async fn client_event_rate_limit_drops_excess_but_keeps_connection() {
    let app = test_app();
    let options = ServerOptions {
        event_burst: 3,
        events_per_second: 1,
        ..Default::default()
    };
    let handler = test_handler(options);
    let (conn_a, mut rx_a) = connect(&handler, &app);
    let (conn_b, mut rx_b) = connect(&handler, &app);

    for (conn, rx) in [(&conn_a, &mut rx_a), (&conn_b, &mut rx_b)] {
        let frame = signed_subscribe_frame(&app, conn, "private-room", None);
        handler.handle_frame(conn, &app, &frame).await.unwrap();
        drain(rx);
    }

    let event =
        json!({"event": "client-typing", "channel": "private-room", "data": "{}"}).to_string();
    for _ in 0..4 {
        handler.handle_frame(&conn_a, &app, &event).await.unwrap();
    }

    // Only the burst makes it through to B.
    let delivered = drain(&mut rx_b);
    assert_eq!(delivered.len(), 3);

    // The sender got exactly one rate-limit error and stays connected.
    let errors = drain(&mut rx_a);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["event"], "pusher:error");
    assert_eq!(errors[0]["data"]["code"], 4301);
    assert_eq!(conn_a.state(), ConnectionState::Established);
}

#[tokio::test]
async fn channel_cap_refuses_further_subscriptions() {
    let mut app = test_app();
    app.max_channels_per_connection = 2;
    let handler = test_handler(ServerOptions::default());
    let (conn, mut rx) = connect(&handler, &app);

    for channel in ["one", "two", "three"] {
        handler
            .handle_frame(&conn, &app, &subscribe_frame(channel))
            .await
            .unwrap();
    }

    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0]["event"], "pusher_internal:subscription_succeeded");
    assert_eq!(frames[1]["event"], "pusher_internal:subscription_succeeded");
    assert_eq!(frames[2]["event"], "pusher:error");
    assert_eq!(frames[2]["data"]["code"], 4301);
    assert_eq!(conn.subscription_count(), 2);
    assert_eq!(conn.state(), ConnectionState::Established);
}

#[tokio::test]
async fn subscribe_rate_limit_applies_per_connection() {
    let app = test_app();
    let options = ServerOptions {
        max_subscriptions_per_second: 2,
        ..Default::default()
    };
    let handler = test_handler(options);
    let (conn, mut rx) = connect(&handler, &app);

    for channel in ["one", "two", "three"] {
        handler
            .handle_frame(&conn, &app, &subscribe_frame(channel))
            .await
            .unwrap();
    }

    let frames = drain(&mut rx);
    assert_eq!(frames[2]["event"], "pusher:error");
    assert_eq!(frames[2]["data"]["code"], 4301);
    assert_eq!(conn.subscription_count(), 2);
}

#[tokio::test]
async fn malformed_frames_get_errors_then_close() {
    let app = test_app();
    let handler = test_handler(ServerOptions::default());
    let (conn, mut rx) = connect(&handler, &app);

    for _ in 0..4 {
        handler.handle_frame(&conn, &app, "not json").await.unwrap();
    }
    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 4);
    assert!(frames.iter().all(|f| f["event"] == "pusher:error"));
    assert_eq!(conn.state(), ConnectionState::Established);

    // The fifth consecutive strike closes the connection.
    handler.handle_frame(&conn, &app, "not json").await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Closing);
}

#[tokio::test]
async fn unknown_events_are_ignored() {
    let app = test_app();
    let handler = test_handler(ServerOptions::default());
    let (conn, mut rx) = connect(&handler, &app);

    handler
        .handle_frame(&conn, &app, r#"{"event":"pusher:something_new"}"#)
        .await
        .unwrap();
    assert!(drain(&mut rx).is_empty());
    assert_eq!(conn.state(), ConnectionState::Established);
}

#[tokio::test]
async fn detach_restores_registry_state() {
    let app = test_app();
    let handler = test_handler(ServerOptions::default());
    let (conn, mut rx) = connect(&handler, &app);

    for channel in ["one", "two"] {
        handler
            .handle_frame(&conn, &app, &subscribe_frame(channel))
            .await
            .unwrap();
    }
    drain(&mut rx);
    assert_eq!(handler.hub.channel_count(), 2);

    handler.hub.detach(&conn.socket_id);
    assert_eq!(handler.hub.channel_count(), 0);
    assert_eq!(handler.hub.connection_count(), 0);
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn publish_excludes_the_named_socket() {
    let app = test_app();
    let handler = test_handler(ServerOptions::default());
    let (conn_a, mut rx_a) = connect(&handler, &app);
    let (conn_b, mut rx_b) = connect(&handler, &app);

    for (conn, rx) in [(&conn_a, &mut rx_a), (&conn_b, &mut rx_b)] {
        handler
            .handle_frame(conn, &app, &subscribe_frame("chat"))
            .await
            .unwrap();
        drain(rx);
    }

    let message = wavehub::protocol::messages::PusherMessage::channel_event(
        "msg",
        "chat",
        wavehub::protocol::messages::MessageData::String("hello".into()),
        None,
    );
    let delivered = handler
        .hub
        .publish(&app.key, "chat", &message, Some(&conn_a.socket_id))
        .unwrap();

    assert_eq!(delivered, 1);
    assert!(drain(&mut rx_a).is_empty());
    assert_eq!(drain(&mut rx_b).len(), 1);
}

#[tokio::test]
async fn app_connection_quota_rejects_attach() {
    let mut app = test_app();
    app.max_connections = 1;
    let handler = test_handler(ServerOptions::default());

    let (_conn, _rx) = connect(&handler, &app);

    let (extra, _extra_rx) = ConnectionHandle::new(
        wavehub::websocket::SocketId::generate(),
        app.key.clone(),
        app.id.clone(),
        &handler.options,
    );
    let result = handler.hub.attach(Arc::new(extra), &app);
    assert!(matches!(
        result,
        Err(wavehub::error::Error::OverConnectionQuota)
    ));
}
