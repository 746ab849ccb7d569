//! Integration tests for the stage sync client
//!
//! These tests run the client against in-process WebSocket and HTTP peers
//! bound to loopback ports.

use client::error::{ClientError, ValidationError};
use client::identity::{FileIdentityStore, MemoryIdentityStore};
use client::liveness::LivenessMonitor;
use client::network::{ConnectionState, EventSink, StreamChannel, TransportEvent};
use client::session::{
    ClientSession, Presenter, PromptSubmission, RegistrationState, RunSubmission, SessionConfig,
};
use assert_approx_eq::assert_approx_eq;
use futures_util::{SinkExt, StreamExt};
use shared::{ActionResponse, Category, ProgressReport, RankingResult, Record};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

/// Shared helpers for spinning up loopback peers
mod support {
    use super::*;

    pub async fn ws_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        (listener, url)
    }

    pub fn channel_sink() -> (EventSink, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: EventSink = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("sink dropped")
    }

    pub type Route = Arc<dyn Fn(&str, &str) -> (u16, String) + Send + Sync>;

    /// Minimal HTTP/1.1 responder. Records "METHOD PATH" and body of every
    /// request and answers through `route`.
    pub struct HttpStub {
        pub base_url: String,
        pub requests: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl HttpStub {
        pub fn requests(&self) -> Vec<(String, String)> {
            self.requests.lock().unwrap().clone()
        }
    }

    pub async fn http_stub(route: Route) -> HttpStub {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let recorded = Arc::clone(&recorded);
                let route = Arc::clone(&route);
                tokio::spawn(async move {
                    serve_one(stream, route, recorded).await;
                });
            }
        });

        HttpStub { base_url, requests }
    }

    async fn serve_one(
        mut stream: TcpStream,
        route: Route,
        recorded: Arc<Mutex<Vec<(String, String)>>>,
    ) {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];

        let header_end = loop {
            let n = match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buffer.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let content_length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);

        while buffer.len() < header_end + content_length {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            }
        }

        let request_line = head.lines().next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();
        let body = String::from_utf8_lossy(&buffer[header_end..]).to_string();

        recorded
            .lock()
            .unwrap()
            .push((format!("{} {}", method, path), body));

        let (status, reply) = route(&method, &path);
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            if status < 400 { "OK" } else { "Error" },
            reply.len(),
            reply
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    }

    pub async fn closed_port_url(scheme: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("{}://{}", scheme, addr)
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum Shown {
        Status(String),
        Error(String),
        Ack(Option<String>),
        Ranking(RankingResult),
        Leaderboard(String, Vec<Record>),
        Progress(Vec<String>),
        Action(Option<String>, u64),
    }

    #[derive(Clone, Default)]
    pub struct Recorder(Arc<Mutex<Vec<Shown>>>);

    impl Recorder {
        pub fn shown(&self) -> Vec<Shown> {
            self.0.lock().unwrap().clone()
        }

        fn push(&self, shown: Shown) {
            self.0.lock().unwrap().push(shown);
        }
    }

    impl Presenter for Recorder {
        fn status(&mut self, message: &str) {
            self.push(Shown::Status(message.to_string()));
        }

        fn error(&mut self, error: &ClientError) {
            self.push(Shown::Error(error.to_string()));
        }

        fn acknowledged(&mut self, received_text: Option<&str>) {
            self.push(Shown::Ack(received_text.map(str::to_string)));
        }

        fn ranking(&mut self, result: &RankingResult) {
            self.push(Shown::Ranking(result.clone()));
        }

        fn leaderboard(&mut self, category: &Category, rows: &[Record]) {
            self.push(Shown::Leaderboard(category.to_string(), rows.to_vec()));
        }

        fn progress(&mut self, report: &ProgressReport) {
            self.push(Shown::Progress(
                report
                    .unlocked_codes()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            ));
        }

        fn action(&mut self, response: &ActionResponse) {
            self.push(Shown::Action(response.code.clone(), response.prompt_length));
        }
    }

    pub fn session(
        config: SessionConfig,
        identity: MemoryIdentityStore,
    ) -> (ClientSession, Recorder) {
        let recorder = Recorder::default();
        let session =
            ClientSession::new(config, Box::new(identity), Box::new(recorder.clone())).unwrap();
        (session, recorder)
    }

    /// Drains the session until `done` holds for what has been presented.
    pub async fn pump_until<F>(session: &mut ClientSession, recorder: &Recorder, done: F)
    where
        F: Fn(&[Shown]) -> bool,
    {
        timeout(WAIT, async {
            while !done(&recorder.shown()) {
                if !session.next_event().await {
                    break;
                }
            }
        })
        .await
        .expect("timed out waiting for presenter output");
    }
}

use support::*;

/// PERSISTENT CHANNEL TESTS
mod stream_channel_tests {
    use super::*;

    /// Tests a full open, send, receive and close cycle against a live peer
    #[tokio::test]
    async fn open_send_and_receive() {
        let (listener, url) = ws_listener().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let received = match ws.next().await {
                Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                other => panic!("expected text frame, got {:?}", other),
            };
            ws.send(Message::text(r#"{"ack": true, "received_text": "ok"}"#.to_string()))
                .await
                .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
            received
        });

        let channel = StreamChannel::new("stream");
        let (sink, mut events) = channel_sink();
        channel.connect(&url, sink);

        assert_eq!(next_event(&mut events).await, TransportEvent::Open);
        assert_eq!(channel.state(), ConnectionState::Open);

        assert_ok!(channel.send(r#"{"id":"p1"}"#));
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Message(r#"{"ack": true, "received_text": "ok"}"#.to_string())
        );

        channel.close();
        assert_eq!(channel.state(), ConnectionState::Closed);

        let received = timeout(WAIT, server).await.unwrap().unwrap();
        assert_eq!(received, r#"{"id":"p1"}"#);
    }

    /// Tests that frames arriving after a local close are never delivered
    #[tokio::test]
    async fn no_events_after_local_close() {
        let (listener, url) = ws_listener().await;
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = go_rx.await;
            for i in 0..5 {
                if ws.send(Message::text(format!("late {}", i))).await.is_err() {
                    break;
                }
            }
        });

        let channel = StreamChannel::new("stream");
        let (sink, mut events) = channel_sink();
        channel.connect(&url, sink);
        assert_eq!(next_event(&mut events).await, TransportEvent::Open);

        channel.close();
        channel.close();
        let _ = go_tx.send(());

        sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(channel.state(), ConnectionState::Closed);
        assert_err!(channel.send("x"));
        assert!(matches!(channel.ping(), Err(ClientError::NotConnected)));
    }

    /// Tests that a peer-initiated close reports its code, reason and cleanliness
    #[tokio::test]
    async fn remote_close_is_reported() {
        let (listener, url) = ws_listener().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".to_string().into(),
            }))
            .await
            .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let channel = StreamChannel::new("chart");
        let (sink, mut events) = channel_sink();
        channel.connect(&url, sink);

        assert_eq!(next_event(&mut events).await, TransportEvent::Open);
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Close {
                code: 1000,
                reason: "done".to_string(),
                was_clean: true,
            }
        );
        assert_eq!(channel.state(), ConnectionState::Closed);
    }

    /// Tests that no delivery starts once close has returned, while frames
    /// keep arriving on other worker threads
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_fences_in_flight_deliveries() {
        for _ in 0..10 {
            let (listener, url) = ws_listener().await;
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                for i in 0..20_000 {
                    if ws.send(Message::text(format!("frame {}", i))).await.is_err() {
                        break;
                    }
                }
            });

            let delivered = Arc::new(AtomicUsize::new(0));
            let late = Arc::new(AtomicUsize::new(0));
            let returned = Arc::new(AtomicBool::new(false));
            let sink: EventSink = {
                let delivered = Arc::clone(&delivered);
                let late = Arc::clone(&late);
                let returned = Arc::clone(&returned);
                Arc::new(move |_event| {
                    if returned.load(Ordering::SeqCst) {
                        late.fetch_add(1, Ordering::SeqCst);
                    }
                    delivered.fetch_add(1, Ordering::SeqCst);
                })
            };

            let channel = StreamChannel::new("stream");
            channel.connect(&url, sink);
            timeout(WAIT, async {
                while delivered.load(Ordering::SeqCst) < 100 {
                    sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .expect("flood never started");

            channel.close();
            returned.store(true, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;

            assert_eq!(late.load(Ordering::SeqCst), 0);
            assert_eq!(channel.state(), ConnectionState::Closed);
        }
    }

    /// Tests that the liveness monitor keeps pinging until the channel closes
    #[tokio::test]
    async fn liveness_monitor_pings_open_channel() {
        let (listener, url) = ws_listener().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut pings = 0u32;
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Ping(_) => pings += 1,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            pings
        });

        let channel = StreamChannel::new("stream");
        let (sink, mut events) = channel_sink();
        channel.connect(&url, sink);
        assert_eq!(next_event(&mut events).await, TransportEvent::Open);

        let monitor = LivenessMonitor::spawn(channel.clone(), Duration::from_millis(25));
        sleep(Duration::from_millis(200)).await;
        channel.close();

        let probes = timeout(WAIT, monitor.join()).await.unwrap();
        assert!(probes >= 2, "only {} probes sent", probes);

        let pings = timeout(WAIT, server).await.unwrap().unwrap();
        assert!(pings >= 2, "server only saw {} pings", pings);
    }
}

/// SESSION TESTS
mod session_tests {
    use super::*;

    /// Tests that a submitted run is acknowledged and its ranking presented
    #[tokio::test]
    async fn submission_is_acknowledged_and_ranked() {
        let (listener, url) = ws_listener().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let payload: serde_json::Value = match ws.next().await {
                Some(Ok(Message::Text(text))) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("expected submission, got {:?}", other),
            };

            ws.send(Message::text(r#"{"ack": true, "received_text": "stored"}"#.to_string()))
                .await
                .unwrap();
            ws.send(Message::text(
                r#"{"ack": true, "user_id": "player_001", "stage": "A1",
                    "rank_tokens_percent": 25.0, "rank_clear_time_percent": null,
                    "rank_tokens": 3, "rank_clear_time": 7, "total_records": 12}"#
                    .to_string(),
            ))
            .await
            .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
            payload
        });

        let (mut session, recorder) = session(
            SessionConfig::default().with_stream_url(url),
            MemoryIdentityStore::with_saved("player_001"),
        );
        session.connect_stream();
        pump_until(&mut session, &recorder, |shown| {
            shown.contains(&Shown::Status("stream connected".to_string()))
        })
        .await;

        let id = session.participant_id().unwrap().to_string();
        assert_ok!(session.submit_run(&RunSubmission::new(id, "A1", 42, 12_500)));

        pump_until(&mut session, &recorder, |shown| {
            shown.iter().any(|s| matches!(s, Shown::Ranking(_)))
        })
        .await;

        let shown = recorder.shown();
        assert!(shown.contains(&Shown::Ack(Some("stored".to_string()))));
        let ranking = session.board().last_ranking().unwrap();
        assert_eq!(ranking.participant_id, "player_001");
        assert_eq!(ranking.score_rank, 3);
        assert_approx_eq!(ranking.score_percentile, 25.0, 1e-9);
        assert_approx_eq!(ranking.duration_percentile, 0.0, 1e-9);
        assert_eq!(ranking.total_records, 12);

        session.shutdown();
        let payload = timeout(WAIT, server).await.unwrap().unwrap();
        assert_eq!(payload["id"], "player_001");
        assert_eq!(payload["stage"], "A1");
        assert_eq!(payload["tokens"], 42);
        assert_eq!(payload["clear_time"], 12_500);
    }

    /// Tests that a negative acknowledgement surfaces as an error
    #[tokio::test]
    async fn rejected_submission_is_shown() {
        let (listener, url) = ws_listener().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            ws.send(Message::text(
                r#"{"ack": false, "db_error": "IntegrityError"}"#.to_string(),
            ))
            .await
            .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (mut session, recorder) = session(
            SessionConfig::default().with_stream_url(url),
            MemoryIdentityStore::new(),
        );
        session.connect_stream();
        pump_until(&mut session, &recorder, |shown| {
            shown.contains(&Shown::Status("stream connected".to_string()))
        })
        .await;

        session
            .submit_run(&RunSubmission::new("p9", "B2", 1, 1))
            .unwrap();
        pump_until(&mut session, &recorder, |shown| {
            shown.iter().any(|s| matches!(s, Shown::Error(_)))
        })
        .await;

        assert!(recorder.shown().contains(&Shown::Error(
            "remote rejected request: IntegrityError".to_string()
        )));
    }

    /// Tests that invalid runs are rejected locally and never transmitted
    #[tokio::test]
    async fn empty_participant_never_reaches_the_wire() {
        let (listener, url) = ws_listener().await;
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    let _ = seen_tx.send(text.as_str().to_string());
                }
            }
        });

        let (mut session, recorder) = session(
            SessionConfig::default().with_stream_url(url),
            MemoryIdentityStore::new(),
        );
        session.connect_stream();
        pump_until(&mut session, &recorder, |shown| {
            shown.contains(&Shown::Status("stream connected".to_string()))
        })
        .await;

        let result = session.submit_run(&RunSubmission::new("", "A1", 5, 5));
        assert!(matches!(
            result,
            Err(ClientError::Validation(ValidationError::EmptyParticipant))
        ));
        let result = session.submit_run(&RunSubmission::new("p1", "A1", -5, 5));
        assert!(matches!(
            result,
            Err(ClientError::Validation(ValidationError::NegativeScore(-5)))
        ));

        sleep(Duration::from_millis(50)).await;
        assert!(seen_rx.try_recv().is_err());
        session.shutdown();
    }

    /// Tests that a prompt goes out with its wire names and that both reply
    /// kinds reach the presenter
    #[tokio::test]
    async fn prompt_replies_are_presented() {
        let (listener, url) = ws_listener().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut prompts = Vec::new();

            for reply in [
                r#"{"code": "Jump", "promptLen": 10, "error": null}"#,
                r#"{"code": null, "promptLen": 5, "error": "no action matched"}"#,
            ] {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let payload: serde_json::Value =
                            serde_json::from_str(text.as_str()).unwrap();
                        prompts.push(payload);
                    }
                    other => panic!("expected prompt, got {:?}", other),
                }
                ws.send(Message::text(reply.to_string())).await.unwrap();
            }
            while let Some(Ok(_)) = ws.next().await {}
            prompts
        });

        let (mut session, recorder) = session(
            SessionConfig::default().with_prompt_url(url),
            MemoryIdentityStore::with_saved("player_001"),
        );
        session.connect_prompt();
        pump_until(&mut session, &recorder, |shown| {
            shown.contains(&Shown::Status("prompt connected".to_string()))
        })
        .await;

        let id = session.participant_id().unwrap().to_string();
        assert_ok!(session.submit_prompt(&PromptSubmission::new(id.as_str(), "A1", "jump twice")));
        pump_until(&mut session, &recorder, |shown| {
            shown.iter().any(|s| matches!(s, Shown::Action(..)))
        })
        .await;

        assert_ok!(session.submit_prompt(&PromptSubmission::new(id.as_str(), "A1", "dance")));
        pump_until(&mut session, &recorder, |shown| {
            shown.iter().any(|s| matches!(s, Shown::Error(_)))
        })
        .await;

        let shown = recorder.shown();
        assert!(shown.contains(&Shown::Action(Some("Jump".to_string()), 10)));
        assert!(shown.contains(&Shown::Error(
            "remote rejected request: no action matched".to_string()
        )));

        session.shutdown();
        assert_eq!(session.prompt_state(), ConnectionState::Closed);
        let prompts = timeout(WAIT, server).await.unwrap().unwrap();
        assert_eq!(
            prompts[0],
            serde_json::json!({"userId": "player_001", "stageId": "A1", "prompt": "jump twice"})
        );
        assert_eq!(prompts[1]["prompt"], "dance");
    }

    /// Tests that chart frames aggregate into the watched ranked view
    #[tokio::test]
    async fn chart_feed_builds_watched_leaderboard() {
        let (listener, url) = ws_listener().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            for frame in [
                r#"{"type": "snapshot", "rows": [
                    {"id": "p1", "stage": "A1", "tokens": 10, "clear_time": 500},
                    {"id": "p2", "stage": 11, "tokens": 3, "clear_time": 200},
                    {"id": "p2", "stage": "A1", "tokens": 7, "clear_time": 900}
                ]}"#,
                "this is not json",
                r#"{"id": "p1", "stage": "A1", "tokens": 8, "clear_time": 600}"#,
                r#"{"id": "p1", "stage": "A1", "tokens": 8, "clear_time": 400}"#,
                r#"{"id": "p3", "stage": "A1", "tokens": null, "clear_time": 50}"#,
            ] {
                ws.send(Message::text(frame.to_string())).await.unwrap();
            }
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (mut session, recorder) = session(
            SessionConfig::default()
                .with_chart_url(url)
                .with_watched("A1"),
            MemoryIdentityStore::new(),
        );
        session.connect_chart();

        pump_until(&mut session, &recorder, |shown| {
            shown
                .iter()
                .filter(|s| matches!(s, Shown::Leaderboard(..)))
                .count()
                >= 4
        })
        .await;

        let expected = vec![
            Record::new("p3", "A1", 0, 50),
            Record::new("p2", "A1", 7, 900),
            Record::new("p1", "A1", 8, 400),
        ];
        assert_eq!(session.ranked(&Category::from("A1")), expected);
        assert_eq!(
            recorder.shown().last(),
            Some(&Shown::Leaderboard("A1".to_string(), expected))
        );
        assert_eq!(
            session.ranked(&Category::from("11")),
            vec![Record::new("p2", "11", 3, 200)]
        );
        assert_eq!(session.dispatcher().failed(), 1);

        session.shutdown();
        assert_eq!(session.chart_state(), ConnectionState::Closed);
    }
}

/// REQUEST/RESPONSE TESTS
mod http_tests {
    use super::*;

    const PROGRESS: &str = r#"{
        "user_id": "player_001",
        "stages": [
            {"code": "A1", "unlocked": true, "cleared": true, "prompt_length": 40, "clear_time_ms": 9000, "cleared_at": "2024-05-01T10:00:00"},
            {"code": "A2", "unlocked": true, "cleared": null},
            {"code": "B1", "unlocked": false}
        ]
    }"#;

    fn progress_route() -> Route {
        Arc::new(|method: &str, path: &str| match (method, path) {
            ("POST", "/users") => (200, r#"{"ok": true}"#.to_string()),
            ("GET", "/progress/player_001") => (200, PROGRESS.to_string()),
            _ => (404, r#"{"detail": "not found"}"#.to_string()),
        })
    }

    /// Tests that registering without progress makes exactly one request
    #[tokio::test]
    async fn register_without_progress_makes_one_call() {
        let stub = http_stub(progress_route()).await;
        let identity = MemoryIdentityStore::new();
        let (mut session, recorder) = session(
            SessionConfig::default().with_rest_base_url(&stub.base_url),
            identity,
        );

        let progress = session.register("player_001", false).await.unwrap();
        assert!(progress.is_none());
        assert_eq!(
            session.registration(),
            &RegistrationState::Registered("player_001".to_string())
        );

        let requests = stub.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "POST /users");
        let body: serde_json::Value = serde_json::from_str(&requests[0].1).unwrap();
        assert_eq!(body["user_id"], "player_001");

        assert!(recorder
            .shown()
            .contains(&Shown::Status("Registered ID: player_001".to_string())));
    }

    /// Tests that registering with progress also fetches unlocked stages
    #[tokio::test]
    async fn register_with_progress_fetches_unlocked_stages() {
        let stub = http_stub(progress_route()).await;
        let (mut session, recorder) = session(
            SessionConfig::default().with_rest_base_url(&stub.base_url),
            MemoryIdentityStore::new(),
        );

        let report = session
            .register("player_001", true)
            .await
            .unwrap()
            .expect("progress requested");
        assert_eq!(report.unlocked_codes(), vec!["A1", "A2"]);
        assert!(!report.stages[1].cleared);

        let paths: Vec<String> = stub.requests().into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["POST /users", "GET /progress/player_001"]);
        assert!(recorder
            .shown()
            .contains(&Shown::Progress(vec!["A1".to_string(), "A2".to_string()])));
    }

    /// Tests that restoring an identity and connecting perform no requests
    #[tokio::test]
    async fn saved_identity_and_connect_do_not_fetch() {
        let stub = http_stub(progress_route()).await;
        let (chart_listener, chart_url) = ws_listener().await;
        tokio::spawn(async move {
            let (stream, _) = chart_listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (mut session, recorder) = session(
            SessionConfig::default()
                .with_rest_base_url(&stub.base_url)
                .with_chart_url(chart_url),
            MemoryIdentityStore::with_saved("player_001"),
        );
        session.connect_chart();
        pump_until(&mut session, &recorder, |shown| {
            shown.contains(&Shown::Status("chart connected".to_string()))
        })
        .await;

        sleep(Duration::from_millis(50)).await;
        assert!(stub.requests().is_empty());

        session.refresh_progress("player_001").await.unwrap();
        assert_eq!(stub.requests().len(), 1);
        session.shutdown();
    }

    /// Tests that a conflicting registration is a remote rejection
    #[tokio::test]
    async fn duplicate_registration_is_remote_rejection() {
        let stub = http_stub(Arc::new(|_: &str, _: &str| {
            (409, r#"{"detail": "user exists"}"#.to_string())
        }))
        .await;
        let (mut session, recorder) = session(
            SessionConfig::default().with_rest_base_url(&stub.base_url),
            MemoryIdentityStore::new(),
        );

        let err = session.register("player_001", true).await.unwrap_err();
        match &err {
            ClientError::RemoteRejected { status, body } => {
                assert_eq!(*status, Some(409));
                assert!(body.contains("user exists"));
            }
            other => panic!("expected remote rejection, got {:?}", other),
        }
        assert!(!err.is_local());
        assert_eq!(session.registration(), &RegistrationState::Unregistered);
        // No progress call after a failed registration
        assert_eq!(stub.requests().len(), 1);
        assert!(matches!(recorder.shown().last(), Some(Shown::Error(_))));
    }

    /// Tests that a refused connection is reported as unreachable
    #[tokio::test]
    async fn unreachable_service_is_reported() {
        let base_url = closed_port_url("http").await;
        let (mut session, _recorder) = session(
            SessionConfig::default().with_rest_base_url(base_url),
            MemoryIdentityStore::new(),
        );

        let err = session.register("player_001", false).await.unwrap_err();
        assert!(matches!(err, ClientError::Unreachable(_)));
        assert_eq!(session.registration(), &RegistrationState::Unregistered);
    }

    /// Tests that a stalled service hits the request timeout
    #[tokio::test]
    async fn slow_service_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let (mut session, _recorder) = session(
            SessionConfig::default()
                .with_rest_base_url(base_url)
                .with_request_timeout(Duration::from_millis(100)),
            MemoryIdentityStore::new(),
        );

        let err = timeout(WAIT, session.refresh_progress("player_001"))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ClientError::Unreachable(_)));
    }

    /// Tests that a registered id is restored by the next session
    #[tokio::test]
    async fn registered_id_survives_restart() {
        let stub = http_stub(progress_route()).await;
        let dir = std::env::temp_dir().join(format!("stage-sync-it-{}", std::process::id()));
        let path = dir.join("user_id");
        let config = SessionConfig::default().with_rest_base_url(&stub.base_url);

        {
            let mut session = ClientSession::new(
                config.clone(),
                Box::new(FileIdentityStore::new(&path)),
                Box::new(Recorder::default()),
            )
            .unwrap();
            session.register("player_007", false).await.unwrap();
        }

        let restarted = ClientSession::new(
            config,
            Box::new(FileIdentityStore::new(&path)),
            Box::new(Recorder::default()),
        )
        .unwrap();
        assert_eq!(restarted.participant_id(), Some("player_007"));
        // Restoring the saved id performs no request
        assert_eq!(stub.requests().len(), 1);

        let _ = std::fs::remove_dir_all(dir);
    }
}
