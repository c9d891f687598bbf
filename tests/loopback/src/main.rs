//! Loopback harness: a real server and client wired through localhost.
//!
//! `cargo run -p loopback` starts a server, connects a client, makes a
//! call, receives a push, and exits. The test module drives the same
//! stack through disconnects, replays, and session loss.

use std::time::Duration;

use anyhow::Context;
use serde_json::{Value, json};
use tether_client::{ClientEvent, Supervisor, SupervisorConfig};
use tether_server::{MessageServer, MethodError, MethodRegistry, ServerConfig};
use tracing_subscriber::EnvFilter;

fn demo_methods() -> MethodRegistry {
    let mut methods = MethodRegistry::new();
    methods.register("add", |_caller, args: Value| async move {
        let a = args["a"]
            .as_i64()
            .ok_or_else(|| MethodError::from("missing argument: a"))?;
        let b = args["b"]
            .as_i64()
            .ok_or_else(|| MethodError::from("missing argument: b"))?;
        Ok(Value::from(a + b))
    });
    methods.register("echo", |_caller, args| async move { Ok(args) });
    methods
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = MessageServer::new(ServerConfig::default(), demo_methods());
    let runner = server.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            tracing::error!("server stopped: {e}");
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let port = server.port().await;

    let client = Supervisor::new(SupervisorConfig::new(format!("ws://127.0.0.1:{port}")));
    let mut events = client
        .take_events()
        .await
        .context("event stream already taken")?;
    client.connect().await?;
    let id = client
        .client_id()
        .await
        .context("connected client has no id")?;
    println!("connected as {id}");

    let sum = client.call("add", Some(&json!({"a": 2, "b": 3}))).await?;
    println!("add(2, 3) = {sum}");

    server
        .push_to_one(&id, Some("jobs"), "done", Some(json!({"job": 7})))
        .await?;
    while let Some(ev) = events.recv().await {
        if let ClientEvent::Push {
            channel,
            event,
            data,
        } = ev
        {
            println!("push on {channel:?}: {event} {data:?}");
            break;
        }
    }

    client.close().await;
    server.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::{SinkExt, StreamExt};
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    use tether_client::{CallError, ConnectionState};
    use tether_protocol::Frame;
    use tether_server::SessionConfig;

    use super::*;

    type RawWs = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    fn test_methods() -> MethodRegistry {
        let mut methods = demo_methods();
        methods.register("slow", |_caller, _args| async {
            sleep(Duration::from_millis(200)).await;
            Ok(Value::from("slow"))
        });
        methods.register("fast", |_caller, _args| async { Ok(Value::from("fast")) });
        methods
    }

    async fn start_server(config: ServerConfig) -> (Arc<MessageServer>, u16) {
        let server = MessageServer::new(config, test_methods());
        let runner = server.clone();
        tokio::spawn(async move {
            let _ = runner.run().await;
        });
        sleep(Duration::from_millis(50)).await;
        let port = server.port().await;
        assert_ne!(port, 0, "server failed to bind");
        (server, port)
    }

    fn client_for(port: u16) -> Supervisor {
        Supervisor::new(SupervisorConfig::new(format!("ws://127.0.0.1:{port}")))
    }

    /// Opens a bare WebSocket claiming an existing session, the way a
    /// second browser tab would, and waits for the server's handshake
    /// reply so the takeover has definitely landed.
    async fn claim_session(port: u16, client_id: &str, last_seq: u64) -> RawWs {
        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}"))
            .await
            .expect("raw connect");
        let hello = serde_json::to_string(&Frame::connect(Some(client_id), last_seq)).unwrap();
        ws.send(WsMessage::Text(hello.into())).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if let WsMessage::Text(text) = msg
                && let Ok(frame) = serde_json::from_str::<Frame>(&text)
                && frame.client_id.is_some()
            {
                return ws;
            }
        }
        panic!("no handshake reply on raw socket");
    }

    async fn next_push(
        events: &mut mpsc::Receiver<ClientEvent>,
    ) -> (Option<String>, String, Option<Value>) {
        timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(ClientEvent::Push {
                        channel,
                        event,
                        data,
                    }) => return (channel, event, data),
                    Some(_) => continue,
                    None => panic!("event stream ended"),
                }
            }
        })
        .await
        .expect("timed out waiting for a push")
    }

    async fn wait_for(
        events: &mut mpsc::Receiver<ClientEvent>,
        what: &str,
        mut pred: impl FnMut(&ClientEvent) -> bool,
    ) {
        timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(ev) if pred(&ev) => return,
                    Some(_) => continue,
                    None => panic!("event stream ended waiting for {what}"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn call_round_trip() {
        let (server, port) = start_server(ServerConfig::default()).await;
        let client = client_for(port);
        client.connect().await.unwrap();
        assert_eq!(client.state().await, ConnectionState::Connected);
        assert!(client.client_id().await.is_some());

        let sum = client
            .call("add", Some(&json!({"a": 2, "b": 3})))
            .await
            .unwrap();
        assert_eq!(sum, json!(5));

        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn unknown_method_fails_without_killing_the_connection() {
        let (server, port) = start_server(ServerConfig::default()).await;
        let client = client_for(port);
        client.connect().await.unwrap();

        let err = client
            .call("frobnicate", None::<&Value>)
            .await
            .unwrap_err();
        match err {
            CallError::Method(message) => assert_eq!(message, "unknown method: frobnicate"),
            other => panic!("expected a method error, got {other:?}"),
        }

        let sum = client
            .call("add", Some(&json!({"a": 20, "b": 22})))
            .await
            .unwrap();
        assert_eq!(sum, json!(42));

        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn slow_calls_do_not_block_fast_ones() {
        let (server, port) = start_server(ServerConfig::default()).await;
        let client = Arc::new(client_for(port));
        client.connect().await.unwrap();

        let (done_tx, mut done_rx) = mpsc::channel(2);
        for name in ["slow", "fast"] {
            let client = client.clone();
            let done = done_tx.clone();
            tokio::spawn(async move {
                let result = client.call(name, None::<&Value>).await;
                let _ = done.send(result).await;
            });
            // Issue slow strictly before fast.
            sleep(Duration::from_millis(20)).await;
        }

        let first = timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .expect("calls should finish well within the deadline")
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .expect("calls should finish well within the deadline")
            .unwrap()
            .unwrap();
        assert_eq!(first, json!("fast"));
        assert_eq!(second, json!("slow"));

        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn slow_calls_on_a_live_connection_never_expire() {
        let (server, port) = start_server(ServerConfig::default()).await;
        let mut config = SupervisorConfig::new(format!("ws://127.0.0.1:{port}"));
        config.ack_interval = Duration::from_millis(20);
        config.max_pending_age = Some(Duration::from_millis(50));
        let client = Supervisor::new(config);
        client.connect().await.unwrap();

        // The handler outlives the age limit several times over; on a
        // healthy connection the client keeps waiting for it.
        let value = client.call("slow", None::<&Value>).await.unwrap();
        assert_eq!(value, json!("slow"));
        assert_eq!(client.state().await, ConnectionState::Connected);

        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn broadcasts_reach_every_connected_client() {
        let (server, port) = start_server(ServerConfig::default()).await;
        let one = client_for(port);
        let two = client_for(port);
        let mut events_one = one.take_events().await.unwrap();
        let mut events_two = two.take_events().await.unwrap();
        one.connect().await.unwrap();
        two.connect().await.unwrap();

        server
            .push_to_all(Some("ops"), "maintenance", Some(json!({"at": "03:00"})))
            .await
            .unwrap();

        for events in [&mut events_one, &mut events_two] {
            let (channel, event, data) = next_push(events).await;
            assert_eq!(channel.as_deref(), Some("ops"));
            assert_eq!(event, "maintenance");
            assert_eq!(data, Some(json!({"at": "03:00"})));
        }

        one.close().await;
        two.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn pushes_while_away_replay_in_order_exactly_once() {
        let (server, port) = start_server(ServerConfig::default()).await;
        let client = client_for(port);
        let mut events = client.take_events().await.unwrap();
        client.connect().await.unwrap();
        let id = client.client_id().await.unwrap();

        // Seq 1: a normal call while attached.
        let sum = client
            .call("add", Some(&json!({"a": 1, "b": 1})))
            .await
            .unwrap();
        assert_eq!(sum, json!(2));

        // A second socket takes the session over, then goes away too.
        let raw = claim_session(port, &id, 1).await;
        wait_for(&mut events, "supersede", |ev| {
            matches!(ev, ClientEvent::StateChanged(ConnectionState::Disconnected))
        })
        .await;
        drop(raw);
        sleep(Duration::from_millis(100)).await;

        // Seq 2 and 3 land in the buffer with nobody attached.
        server
            .push_to_one(&id, Some("jobs"), "started", Some(json!({"job": 1})))
            .await
            .unwrap();
        server
            .push_to_one(&id, Some("jobs"), "finished", Some(json!({"job": 1})))
            .await
            .unwrap();

        client.connect().await.unwrap();

        let (channel, event, data) = next_push(&mut events).await;
        assert_eq!(channel.as_deref(), Some("jobs"));
        assert_eq!(event, "started");
        assert_eq!(data, Some(json!({"job": 1})));
        let (_, event, _) = next_push(&mut events).await;
        assert_eq!(event, "finished");

        // Nothing replays twice.
        sleep(Duration::from_millis(150)).await;
        let mut extra = 0;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, ClientEvent::Push { .. }) {
                extra += 1;
            }
        }
        assert_eq!(extra, 0, "a push was delivered twice");

        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn supersession_rejects_calls_left_in_flight() {
        let (server, port) = start_server(ServerConfig::default()).await;
        let client = Arc::new(client_for(port));
        let mut events = client.take_events().await.unwrap();
        client.connect().await.unwrap();
        let id = client.client_id().await.unwrap();

        let caller = client.clone();
        let in_flight = tokio::spawn(async move { caller.call("slow", None::<&Value>).await });
        sleep(Duration::from_millis(20)).await;

        // A second holder takes the session over while the call runs.
        let raw = claim_session(port, &id, 0).await;
        wait_for(&mut events, "supersede", |ev| {
            matches!(ev, ClientEvent::StateChanged(ConnectionState::Disconnected))
        })
        .await;

        let outcome = timeout(Duration::from_secs(1), in_flight)
            .await
            .expect("superseded call must resolve, not hang")
            .unwrap();
        assert!(matches!(outcome, Err(CallError::SessionLost)));

        drop(raw);
        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn superseded_client_does_not_reconnect() {
        let (server, port) = start_server(ServerConfig::default()).await;
        let client = client_for(port);
        let mut events = client.take_events().await.unwrap();
        client.connect().await.unwrap();
        let id = client.client_id().await.unwrap();

        let _raw = claim_session(port, &id, 0).await;
        wait_for(&mut events, "supersede", |ev| {
            matches!(ev, ClientEvent::StateChanged(ConnectionState::Disconnected))
        })
        .await;

        // Long enough for several reconnect attempts, were any scheduled.
        sleep(Duration::from_millis(600)).await;
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert!(events.try_recv().is_err(), "no further activity expected");

        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn overflowing_the_buffer_forces_a_reload() {
        let config = ServerConfig {
            session: SessionConfig { buffer_cap: 2 },
            ..ServerConfig::default()
        };
        let (server, port) = start_server(config).await;
        let client = client_for(port);
        let mut events = client.take_events().await.unwrap();
        client.connect().await.unwrap();
        let id = client.client_id().await.unwrap();

        let raw = claim_session(port, &id, 0).await;
        wait_for(&mut events, "supersede", |ev| {
            matches!(ev, ClientEvent::StateChanged(ConnectionState::Disconnected))
        })
        .await;
        drop(raw);
        sleep(Duration::from_millis(100)).await;

        // Three pushes into a two-slot buffer: the first is gone for good.
        for n in 1..=3 {
            server
                .push_to_one(&id, None, "tick", Some(json!({"n": n})))
                .await
                .unwrap();
        }

        client.connect().await.unwrap();
        wait_for(&mut events, "reload notice", |ev| {
            matches!(ev, ClientEvent::NeedReload)
        })
        .await;

        // The gap is unrecoverable, so none of the buffered pushes arrive.
        sleep(Duration::from_millis(150)).await;
        while let Ok(ev) = events.try_recv() {
            assert!(
                !matches!(ev, ClientEvent::Push { .. }),
                "evicted history must not replay"
            );
        }

        // The session itself carries on under the same identity.
        assert_eq!(client.client_id().await.as_deref(), Some(id.as_str()));
        server
            .push_to_one(&id, None, "tick", Some(json!({"n": 4})))
            .await
            .unwrap();
        let (_, event, data) = next_push(&mut events).await;
        assert_eq!(event, "tick");
        assert_eq!(data, Some(json!({"n": 4})));

        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn server_restart_mints_a_fresh_session() {
        let (server, port) = start_server(ServerConfig::default()).await;
        let client = client_for(port);
        let mut events = client.take_events().await.unwrap();
        client.connect().await.unwrap();
        let old_id = client.client_id().await.unwrap();

        // Take the whole server down; the client starts probing.
        server.shutdown();
        sleep(Duration::from_millis(100)).await;

        // A new instance on the same port knows nothing about the session.
        let restarted = ServerConfig {
            port,
            ..ServerConfig::default()
        };
        let (server2, _) = start_server(restarted).await;

        wait_for(&mut events, "reload notice", |ev| {
            matches!(ev, ClientEvent::NeedReload)
        })
        .await;
        wait_for(&mut events, "reconnect", |ev| {
            matches!(ev, ClientEvent::StateChanged(ConnectionState::Connected))
        })
        .await;

        let new_id = client.client_id().await.unwrap();
        assert_ne!(
            new_id, old_id,
            "a restarted server cannot resume old sessions"
        );

        let sum = client
            .call("add", Some(&json!({"a": 3, "b": 4})))
            .await
            .unwrap();
        assert_eq!(sum, json!(7));

        client.close().await;
        server2.shutdown();
    }

    #[tokio::test]
    async fn cross_origin_browsers_are_refused() {
        let (server, port) = start_server(ServerConfig::default()).await;

        let mut evil = format!("ws://127.0.0.1:{port}")
            .into_client_request()
            .unwrap();
        evil.headers_mut()
            .insert("Origin", "https://evil.example".parse().unwrap());
        assert!(
            connect_async(evil).await.is_err(),
            "foreign origin must be refused"
        );

        let mut same = format!("ws://127.0.0.1:{port}")
            .into_client_request()
            .unwrap();
        same.headers_mut().insert(
            "Origin",
            format!("http://127.0.0.1:{port}").parse().unwrap(),
        );
        assert!(
            connect_async(same).await.is_ok(),
            "same-origin upgrade must succeed"
        );

        server.shutdown();
    }
}
