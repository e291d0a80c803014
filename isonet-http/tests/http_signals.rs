use std::sync::Arc;
use std::time::Duration;

use isonet_core::{
    Broadcaster, Isonet, IsonetConfig, SignalReceiver, SignalTransport, Target, TransportError,
};
use isonet_http::{router, serve, HttpTransport, ReceiverState, MODE_HEADER};
use isonet_types::{DeliveryMode, HostAccess, IsolateUid, PresenceState, SignalEnvelope};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const PATH: &str = "/isonet-signal";

struct Served {
    isonet: Isonet,
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl Served {
    async fn stop(mut self) {
        self.isonet.stop().await;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

fn config(uid: &str, node: &str) -> IsonetConfig {
    let mut config = IsonetConfig::default();
    config.isolate.uid = Some(uid.to_string());
    config.isolate.node = Some(node.to_string());
    config.discovery.enabled = false;
    config
}

async fn serve_stack(config: IsonetConfig) -> Served {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let transport: Arc<dyn SignalTransport> =
        Arc::new(HttpTransport::new(config.receiver.path.clone()).unwrap());
    let isonet = Isonet::new(config, port, vec![transport]).unwrap();

    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(serve(
        listener,
        router(ReceiverState::for_isonet(&isonet)),
        async move {
            let _ = rx.await;
        },
    ));
    isonet.start().await.unwrap();

    Served {
        isonet,
        port,
        shutdown: Some(tx),
        task,
    }
}

/// Bare receiver endpoint, returning its port
async fn serve_receiver(receiver: Arc<SignalReceiver>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let directory = Arc::new(isonet_core::Directory::new(
        config("bare", "bare-node").resolve_identity(),
    ));
    let app = router(ReceiverState::new(receiver, directory, PATH));
    tokio::spawn(serve(listener, app, std::future::pending()));
    port
}

fn envelope(subject: &str, content: Value) -> SignalEnvelope {
    SignalEnvelope::new(subject, "client".into(), "client", "client-node".into(), content)
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn test_send_over_http_returns_listener_results() {
    let receiver = Arc::new(SignalReceiver::new());
    receiver.register_listener(
        "/demo/*",
        Arc::new(|subject: &str, envelope: &SignalEnvelope| {
            Some(json!({
                "subject": subject,
                "from": envelope.sender_address.clone(),
                "echo": envelope.content.clone(),
            }))
        }),
        100,
    );
    let port = serve_receiver(receiver).await;

    let transport = HttpTransport::new(PATH).unwrap();
    let results = transport
        .deliver(
            &HostAccess::new("127.0.0.1", port),
            DeliveryMode::Send,
            "/demo/hello",
            &envelope("/demo/hello", json!({"n": 1})),
        )
        .await
        .unwrap();

    assert_eq!(
        results,
        vec![json!({"subject": "/demo/hello", "from": "127.0.0.1", "echo": {"n": 1}})]
    );
}

#[tokio::test]
async fn test_modes_over_http() {
    let receiver = Arc::new(SignalReceiver::new());
    receiver.register_listener("/known", Arc::new(|_: &str, _: &SignalEnvelope| None), 100);
    let port = serve_receiver(receiver).await;
    let access = HostAccess::new("127.0.0.1", port);
    let transport = HttpTransport::new(PATH).unwrap();

    // No listener: send answers with nothing, ack is refused
    let results = transport
        .deliver(&access, DeliveryMode::Send, "/unknown", &envelope("/unknown", Value::Null))
        .await
        .unwrap();
    assert!(results.is_empty());

    let err = transport
        .deliver(&access, DeliveryMode::Ack, "/unknown", &envelope("/unknown", Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Rejected { code: 404, .. }));

    let results = transport
        .deliver(&access, DeliveryMode::Ack, "/known", &envelope("/known", Value::Null))
        .await
        .unwrap();
    assert!(results.is_empty());

    let results = transport
        .deliver(&access, DeliveryMode::Forget, "/known", &envelope("/known", Value::Null))
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_unknown_mode_header_is_rejected() {
    let port = serve_receiver(Arc::new(SignalReceiver::new())).await;
    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}{PATH}/anything"))
        .header(MODE_HEADER, "teleport")
        .json(&envelope("/anything", Value::Null))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 501);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], 501);
}

#[tokio::test]
async fn test_unreachable_receiver() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let transport = HttpTransport::new(PATH).unwrap();
    let err = transport
        .deliver(
            &HostAccess::new("127.0.0.1", port),
            DeliveryMode::Send,
            "/demo",
            &envelope("/demo", Value::Null),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Unreachable(..)));
}

#[tokio::test]
async fn test_status_and_health() {
    let served = serve_stack(config("status-check", "node-s")).await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://127.0.0.1:{}/healthz", served.port))
        .send()
        .await
        .unwrap();
    assert!(health.status().is_success());

    let status: Value = client
        .get(format!("http://127.0.0.1:{}{}", served.port, PATH))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["uid"], "status-check");
    assert_eq!(status["node"], "node-s");
    assert_eq!(status["isolates"], 1);

    served.stop().await;
}

#[tokio::test]
async fn test_two_stacks_handshake_over_http() {
    let beta = serve_stack(config("beta", "node-b")).await;

    let mut alpha_config = config("alpha", "node-a");
    alpha_config.updater.dump_source = Some(format!("127.0.0.1:{}", beta.port));
    let alpha = serve_stack(alpha_config).await;

    let alpha_dir = alpha.isonet.directory().clone();
    let beta_dir = beta.isonet.directory().clone();

    assert!(
        eventually(|| alpha_dir.get_presence_state("beta") == Some(PresenceState::Validated)).await,
        "alpha never validated beta"
    );
    assert!(
        eventually(|| beta_dir.get_presence_state("alpha") == Some(PresenceState::Validated)).await,
        "beta never validated alpha"
    );
    assert_eq!(
        beta_dir.get_isolate_access("alpha"),
        Some(HostAccess::new("127.0.0.1", alpha.port))
    );

    // Application signal from alpha to beta over the wire
    beta.isonet.receiver().register_listener(
        "/app/ping",
        Arc::new(|_: &str, envelope: &SignalEnvelope| {
            Some(json!(format!("pong to {}", envelope.sender_uid)))
        }),
        100,
    );
    let broadcaster: &Broadcaster = alpha.isonet.broadcaster();
    let result = broadcaster
        .send("/app/ping", Value::Null, &Target::isolate("beta"))
        .await
        .unwrap();
    assert!(result.is_complete());
    assert_eq!(
        result.results.get(&IsolateUid::new("beta")),
        Some(&vec![json!("pong to alpha")])
    );

    alpha.stop().await;
    beta.stop().await;
}
