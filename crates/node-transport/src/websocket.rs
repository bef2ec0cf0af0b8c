//! Log streaming over WebSocket.

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use node_core::{Executor, Subscription};
use node_session::{Session, SessionId};
use tokio::sync::watch;

use crate::{
    protocol::{
        CLOSE_BAD_QUERY, CLOSE_INSTANCE_ENDED, CLOSE_INTERNAL, CLOSE_INVALID_SESSION, LogsQuery,
    },
    router::AppState,
};

/// `GET /logs` - upgrade and stream the running core's output.
///
/// Query problems are reported as close codes after the upgrade, so clients
/// always get a reason they can act on.
pub async fn logs<E: Executor + 'static>(
    ws: WebSocketUpgrade,
    Query(query): Query<LogsQuery>,
    State(state): State<AppState<E>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket<E: Executor + 'static>(
    mut socket: WebSocket,
    state: AppState<E>,
    query: LogsQuery,
) {
    let (session_id, interval) = match query.parse() {
        Ok(parsed) => parsed,
        Err(reason) => {
            tracing::warn!(%reason, "log stream rejected");
            let _ = socket.send(close(CLOSE_BAD_QUERY, reason)).await;
            return;
        }
    };

    let sessions = state.sessions.subscribe();
    if !state.sessions.validate(session_id) {
        tracing::warn!(%session_id, "log stream rejected: session ID mismatch");
        let _ = socket
            .send(close(CLOSE_INVALID_SESSION, "Session ID mismatch."))
            .await;
        return;
    }

    let subscription = state.supervisor.log_hub().attach(interval);
    tracing::debug!(%session_id, ?interval, "log stream attached");

    let (sink, stream) = socket.split();
    stream_logs(sink, stream, subscription, sessions, session_id).await;
}

/// Forward batches until the instance ends, the session is invalidated or
/// the client leaves. Sends the matching close frame itself.
pub async fn stream_logs<S, R>(
    mut sink: S,
    mut stream: R,
    mut subscription: Subscription,
    mut sessions: watch::Receiver<Option<Session>>,
    session_id: SessionId,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let closing = loop {
        tokio::select! {
            batch = subscription.next_batch() => match batch {
                Some(lines) => {
                    if sink.send(Message::Text(lines.join("\n").into())).await.is_err() {
                        break None;
                    }
                }
                None => break Some(close(CLOSE_INSTANCE_ENDED, "core instance ended")),
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "log stream receive failed");
                    break Some(close(CLOSE_INTERNAL, "receive failed"));
                }
            },
            changed = sessions.changed() => {
                let valid = changed.is_ok()
                    && sessions
                        .borrow_and_update()
                        .as_ref()
                        .is_some_and(|s| s.id == session_id);
                if !valid {
                    break Some(close(CLOSE_INVALID_SESSION, "session invalidated"));
                }
            }
        }
    };

    tracing::debug!(
        %session_id,
        dropped = subscription.dropped(),
        "log stream finished"
    );
    subscription.detach();
    if let Some(frame) = closing {
        let _ = sink.send(frame).await;
    }
}

fn close(code: u16, reason: impl Into<String>) -> Message {
    let reason: String = reason.into();
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        sync::Arc,
        time::Duration,
    };

    use axum::{extract::connect_info::MockConnectInfo, http::StatusCode};
    use futures::channel::mpsc;
    use node_core::LogHub;
    use node_session::SessionManager;
    use serde_json::json;
    use tokio::{net::TcpStream, time::timeout};
    use tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
    };
    use uuid::Uuid;

    use super::*;
    use crate::{
        router::create_router,
        test_support::{HEALTHY, ScriptExecutor, call, state_with},
    };

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    struct Harness {
        frames: mpsc::UnboundedReceiver<Message>,
        client: mpsc::UnboundedSender<Result<Message, axum::Error>>,
        task: tokio::task::JoinHandle<()>,
    }

    fn run(hub: &Arc<LogHub>, sessions: &SessionManager, session_id: SessionId) -> Harness {
        let (sink, frames) = mpsc::unbounded();
        let (client, stream) = mpsc::unbounded();
        let task = tokio::spawn(stream_logs(
            sink,
            stream,
            hub.attach(Duration::ZERO),
            sessions.subscribe(),
            session_id,
        ));
        Harness {
            frames,
            client,
            task,
        }
    }

    async fn next_frame(h: &mut Harness) -> Message {
        timeout(Duration::from_secs(5), h.frames.next())
            .await
            .expect("no frame in time")
            .expect("stream ended")
    }

    fn close_code(msg: &Message) -> Option<u16> {
        match msg {
            Message::Close(Some(frame)) => Some(frame.code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_lines_become_text_frames() {
        let hub = Arc::new(LogHub::new());
        let sessions = SessionManager::new();
        let id = sessions.open(CLIENT);
        let mut h = run(&hub, &sessions, id);

        hub.push_stdout("accepted tcp:1.1.1.1:443");
        let Message::Text(text) = next_frame(&mut h).await else {
            panic!("expected text frame");
        };
        assert_eq!(text.as_str(), "accepted tcp:1.1.1.1:443");
        drop(h.client);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_instance_end_closes_with_4410() {
        let hub = Arc::new(LogHub::new());
        let sessions = SessionManager::new();
        let id = sessions.open(CLIENT);
        let mut h = run(&hub, &sessions, id);

        hub.push_stderr("fatal");
        hub.close();

        assert!(matches!(next_frame(&mut h).await, Message::Text(_)));
        assert_eq!(close_code(&next_frame(&mut h).await), Some(CLOSE_INSTANCE_ENDED));
        h.task.await.unwrap();
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_takeover_closes_with_4403() {
        let hub = Arc::new(LogHub::new());
        let sessions = SessionManager::new();
        let id = sessions.open(CLIENT);
        let mut h = run(&hub, &sessions, id);

        sessions.open(CLIENT);
        assert_eq!(close_code(&next_frame(&mut h).await), Some(CLOSE_INVALID_SESSION));
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_close_detaches_quietly() {
        let hub = Arc::new(LogHub::new());
        let sessions = SessionManager::new();
        let id = sessions.open(CLIENT);
        let mut h = run(&hub, &sessions, id);

        h.client.unbounded_send(Ok(Message::Close(None))).unwrap();
        h.task.await.unwrap();
        assert!(h.frames.next().await.is_none());
        assert_eq!(hub.subscriber_count(), 0);
    }

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn serve(state: AppState<ScriptExecutor>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    async fn open_logs(addr: SocketAddr, query: &str) -> Client {
        let (client, _) = connect_async(format!("ws://{addr}/logs?{query}"))
            .await
            .unwrap();
        client
    }

    async fn next_message(client: &mut Client) -> WsMessage {
        timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no message in time")
            .expect("socket ended")
            .unwrap()
    }

    fn ws_close_code(msg: &WsMessage) -> Option<u16> {
        match msg {
            WsMessage::Close(Some(frame)) => Some(u16::from(frame.code)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_upgrade_with_bad_query_closes_with_4400() {
        let addr = serve(state_with(HEALTHY)).await;

        let mut client = open_logs(addr, "session_id=nope").await;
        assert_eq!(ws_close_code(&next_message(&mut client).await), Some(CLOSE_BAD_QUERY));

        let id = Uuid::new_v4();
        let mut client = open_logs(addr, &format!("session_id={id}&interval=11")).await;
        assert_eq!(ws_close_code(&next_message(&mut client).await), Some(CLOSE_BAD_QUERY));
    }

    #[tokio::test]
    async fn test_upgrade_with_stale_session_closes_with_4403() {
        let state = state_with(HEALTHY);
        let addr = serve(state.clone()).await;

        let mut client = open_logs(addr, &format!("session_id={}", Uuid::new_v4())).await;
        assert_eq!(
            ws_close_code(&next_message(&mut client).await),
            Some(CLOSE_INVALID_SESSION)
        );

        let stale = state.sessions.open(CLIENT);
        state.sessions.open(CLIENT);
        let mut client = open_logs(addr, &format!("session_id={stale}")).await;
        assert_eq!(
            ws_close_code(&next_message(&mut client).await),
            Some(CLOSE_INVALID_SESSION)
        );
    }

    #[tokio::test]
    async fn test_upgrade_without_running_core_closes_with_4410() {
        let state = state_with(HEALTHY);
        let addr = serve(state.clone()).await;
        let id = state.sessions.open(CLIENT);

        let mut client = open_logs(addr, &format!("session_id={id}")).await;
        assert_eq!(
            ws_close_code(&next_message(&mut client).await),
            Some(CLOSE_INSTANCE_ENDED)
        );
    }

    #[tokio::test]
    async fn test_started_core_output_reaches_attached_client() {
        let state = state_with(
            r#"echo "Xray 1.8.4 started"; sleep 1; echo "accepted tcp:1.1.1.1:443"; exec sleep 30"#,
        );
        let addr = serve(state.clone()).await;
        let rest = create_router(state.clone())
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

        let (status, body) = call(&rest, "/connect", None).await;
        assert_eq!(status, StatusCode::OK);
        let session_id = body["session_id"].as_str().unwrap().to_string();
        let (status, body) = call(
            &rest,
            "/start",
            Some(json!({
                "session_id": session_id,
                "config": {"inbounds": [{"tag": "in1"}], "outbounds": []}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");

        let mut client = open_logs(addr, &format!("session_id={session_id}&interval=0")).await;
        let WsMessage::Text(text) = next_message(&mut client).await else {
            panic!("expected text frame");
        };
        assert_eq!(text.as_str(), "accepted tcp:1.1.1.1:443");

        let (status, _) = call(&rest, "/stop", Some(json!({"session_id": session_id}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            ws_close_code(&next_message(&mut client).await),
            Some(CLOSE_INSTANCE_ENDED)
        );
    }
}
