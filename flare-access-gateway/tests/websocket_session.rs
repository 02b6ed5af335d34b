use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flare_access_gateway::infrastructure::auth::TokenClaims;
use flare_access_gateway::infrastructure::{GrpcMessageForwarder, JwtTokenValidator};
use flare_access_gateway::service::ApplicationBootstrap;
use flare_access_gateway::{
    AccessGatewayConfig, ConnectionRegistry, GatewayState, MessageRouter, build_router,
};
use flare_im_core::config::parse_config;
use flare_im_core::discovery::{LoadBalancer, ServiceDiscovery};
use flare_im_core::grpc::GrpcClientManager;
use flare_im_core::id::{SnowflakeGenerator, parse_id};
use flare_im_core::metrics::AccessGatewayMetrics;
use flare_im_core::service_names::MESSAGE_SERVICE;
use flare_proto::flare::message::{
    ForwardMessageRequest, ForwardMessageResponse, MarkMessagesReadRequest,
    MarkMessagesReadResponse,
};
use flare_proto::{MessageLogicService, MessageLogicServiceServer, MessageType, WsMessage};
use flare_signaling_online::{InMemoryPresenceStore, PresenceService};
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header, encode};
use prost::Message as ProstMessage;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tonic::transport::Server;
use tonic::{Request, Response, Status};

const SECRET: &str = "integration-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

macro_rules! eventually {
    ($cond:expr) => {{
        let mut satisfied = false;
        for _ in 0..150 {
            if $cond {
                satisfied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(satisfied, "condition not met: {}", stringify!($cond));
    }};
}

#[derive(Default, Clone)]
struct RecordingLogic {
    forwarded: Arc<Mutex<Vec<ForwardMessageRequest>>>,
    marked: Arc<Mutex<Vec<MarkMessagesReadRequest>>>,
}

#[tonic::async_trait]
impl MessageLogicService for RecordingLogic {
    async fn forward_message(
        &self,
        request: Request<ForwardMessageRequest>,
    ) -> Result<Response<ForwardMessageResponse>, Status> {
        let request = request.into_inner();
        let message_id = request
            .message
            .as_ref()
            .map(|m| m.message_id)
            .unwrap_or_default();
        self.forwarded.lock().unwrap().push(request);
        Ok(Response::new(ForwardMessageResponse { message_id }))
    }

    async fn mark_messages_read(
        &self,
        request: Request<MarkMessagesReadRequest>,
    ) -> Result<Response<MarkMessagesReadResponse>, Status> {
        let request = request.into_inner();
        let updated = request.message_ids.len() as i32;
        self.marked.lock().unwrap().push(request);
        Ok(Response::new(MarkMessagesReadResponse { updated }))
    }
}

struct TestGateway {
    addr: SocketAddr,
    state: Arc<GatewayState>,
    store: Arc<InMemoryPresenceStore>,
    logic: RecordingLogic,
}

async fn spawn_logic_service(logic: RecordingLogic) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(
        Server::builder()
            .add_service(MessageLogicServiceServer::new(logic))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );
    addr
}

async fn spawn_gateway(heartbeat_timeout_seconds: u64) -> TestGateway {
    let logic = RecordingLogic::default();
    let logic_addr = spawn_logic_service(logic.clone()).await;

    let app = parse_config(&format!(
        r#"
        [services.access_gateway]
        gateway_id = "gw-it"
        token_secret = "{SECRET}"
        heartbeat_timeout_seconds = {heartbeat_timeout_seconds}
        machine_id = 5
        "#
    ))
    .unwrap();
    let config = Arc::new(AccessGatewayConfig::from_app_config(&app).unwrap());

    let store = Arc::new(InMemoryPresenceStore::new(config.heartbeat_timeout));
    let metrics = Arc::new(AccessGatewayMetrics::new());
    let registry = Arc::new(ConnectionRegistry::new(
        Arc::new(PresenceService::new(store.clone())),
        metrics.clone(),
        false,
    ));

    let discovery = Arc::new(ServiceDiscovery::from_static(&HashMap::from([(
        MESSAGE_SERVICE.to_string(),
        vec![logic_addr.to_string()],
    )])));
    let grpc_clients = Arc::new(GrpcClientManager::new());
    let id_generator = Arc::new(SnowflakeGenerator::new(config.machine_id).unwrap());
    let forwarder = Arc::new(GrpcMessageForwarder::new(
        discovery,
        LoadBalancer::round_robin(),
        grpc_clients.clone(),
        config.message_service.clone(),
        config.gateway_id.clone(),
        2,
    ));
    let router = Arc::new(MessageRouter::new(
        registry.clone(),
        forwarder,
        id_generator.clone(),
    ));

    let state = Arc::new(GatewayState {
        config,
        registry,
        router,
        validator: Arc::new(JwtTokenValidator::new(SECRET, None)),
        id_generator,
        metrics,
        grpc_clients,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = build_router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, service).await.unwrap();
    });

    TestGateway {
        addr,
        state,
        store,
        logic,
    }
}

fn token_for(user_id: i64) -> String {
    let claims = TokenClaims {
        sub: user_id.to_string(),
        exp: chrono::Utc::now().timestamp() + 600,
        iss: None,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn connect(addr: SocketAddr, user_id: &str, token: &str) -> Result<Client, WsError> {
    let mut request = format!("ws://{addr}/ws").into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    headers.insert("user-id", HeaderValue::from_str(user_id).unwrap());
    headers.insert("client-type", HeaderValue::from_static("web"));
    connect_async(request).await.map(|(stream, _)| stream)
}

fn expect_http_status(result: Result<Client, WsError>, expected: u16) {
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), expected),
        Err(other) => panic!("expected http {expected}, got {other}"),
        Ok(_) => panic!("expected http {expected}, upgrade succeeded"),
    }
}

async fn send_frame(client: &mut Client, frame: &WsMessage) {
    client
        .send(Message::Binary(frame.encode_to_vec().into()))
        .await
        .unwrap();
}

async fn next_binary(client: &mut Client) -> WsMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read error");
        match frame {
            Message::Binary(data) => return WsMessage::decode(data).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

fn frame(message_type: MessageType) -> WsMessage {
    WsMessage {
        message_type: message_type as i32,
        ..Default::default()
    }
}

#[tokio::test]
async fn rejects_bad_upgrade_requests() {
    let gw = spawn_gateway(30).await;

    let mut missing_user = format!("ws://{}/ws", gw.addr).into_client_request().unwrap();
    missing_user
        .headers_mut()
        .insert("authorization", HeaderValue::from_static("Bearer x"));
    match connect_async(missing_user).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 400),
        _ => panic!("expected 400 for missing user id"),
    }

    expect_http_status(connect(gw.addr, "42", "garbage").await, 401);
    expect_http_status(connect(gw.addr, "42", &token_for(43)).await, 401);
    expect_http_status(connect(gw.addr, "abc", &token_for(42)).await, 400);

    assert_eq!(gw.state.registry.local_connections(), 0);
    assert!(gw.store.connections(42).await.is_empty());
}

#[tokio::test]
async fn registers_one_local_handle_and_one_record() {
    let gw = spawn_gateway(30).await;
    let _client = connect(gw.addr, "42", &token_for(42)).await.unwrap();

    eventually!(gw.state.registry.local_connections() == 1);

    let local = gw.state.registry.local(42).unwrap();
    let records = gw.store.connections(42).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].conn_id, local.conn_id);
    assert_eq!(records[0].instance_id, "gw-it");
    assert!(local.conn_id.starts_with("42_"));
}

#[tokio::test]
async fn malformed_and_unknown_frames_keep_session_alive() {
    let gw = spawn_gateway(30).await;
    let mut client = connect(gw.addr, "42", &token_for(42)).await.unwrap();
    eventually!(gw.state.registry.local_connections() == 1);

    client
        .send(Message::Binary(vec![0xff, 0xff, 0xff].into()))
        .await
        .unwrap();
    let mut unknown = frame(MessageType::Unspecified);
    unknown.message_type = 99;
    send_frame(&mut client, &unknown).await;

    let mut heartbeat = frame(MessageType::Heartbeat);
    heartbeat.message_id = 9;
    send_frame(&mut client, &heartbeat).await;

    let reply = next_binary(&mut client).await;
    assert_eq!(reply.message_type, MessageType::Heartbeat as i32);
    assert_eq!(reply.ack_id, 9);
    assert_eq!(gw.state.metrics.malformed_frames_total.get(), 1);
    assert_eq!(gw.state.registry.local_connections(), 1);
}

#[tokio::test]
async fn text_and_ack_frames_reach_message_service() {
    let gw = spawn_gateway(30).await;
    let mut client = connect(gw.addr, "42", &token_for(42)).await.unwrap();
    eventually!(gw.state.registry.local_connections() == 1);

    let mut text = frame(MessageType::Text);
    text.to = 7;
    text.content = "hello".to_string();
    send_frame(&mut client, &text).await;

    eventually!(gw.logic.forwarded.lock().unwrap().len() == 1);
    let forwarded = gw.logic.forwarded.lock().unwrap()[0].clone();
    let message = forwarded.message.unwrap();
    assert_eq!(message.from, 42);
    assert_eq!(message.to, 7);
    assert_eq!(message.content, "hello");
    assert_eq!(parse_id(message.message_id).machine_id, 5);
    assert_eq!(forwarded.gateway_id, "gw-it");
    assert_eq!(
        forwarded.conn_id,
        gw.state.registry.local(42).unwrap().conn_id
    );

    let mut ack = frame(MessageType::Ack);
    ack.ack_id = message.message_id;
    send_frame(&mut client, &ack).await;

    eventually!(gw.logic.marked.lock().unwrap().len() == 1);
    let marked = gw.logic.marked.lock().unwrap()[0].clone();
    assert_eq!(marked.user_id, 42);
    assert_eq!(marked.message_ids, vec![message.message_id]);
    assert_eq!(gw.state.grpc_clients.health_check().get(MESSAGE_SERVICE), Some(&true));
}

#[tokio::test]
async fn ping_refreshes_heartbeat_and_is_answered() {
    let gw = spawn_gateway(30).await;
    let mut client = connect(gw.addr, "42", &token_for(42)).await.unwrap();
    eventually!(gw.state.registry.local_connections() == 1);
    let before = gw.store.connections(42).await[0].last_heartbeat_at;

    tokio::time::sleep(Duration::from_millis(20)).await;
    client
        .send(Message::Ping(vec![1, 2, 3].into()))
        .await
        .unwrap();

    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), client.next())
            .await
            .expect("timed out waiting for pong")
            .expect("stream ended")
            .expect("read error");
        if let Message::Pong(payload) = frame {
            assert_eq!(payload.as_ref(), &[1, 2, 3]);
            break;
        }
    }

    eventually!(gw.store.connections(42).await[0].last_heartbeat_at > before);
}

#[tokio::test]
async fn disconnect_cleans_up_local_and_distributed_state() {
    let gw = spawn_gateway(30).await;
    let mut client = connect(gw.addr, "42", &token_for(42)).await.unwrap();
    eventually!(gw.state.registry.local_connections() == 1);

    client.close(None).await.unwrap();

    eventually!(gw.state.registry.local_connections() == 0);
    eventually!(!gw.state.registry.online_status(&[42]).await.unwrap()[&42]);
    assert_eq!(gw.state.metrics.connection_disconnected_total.get(), 1);
}

#[tokio::test]
async fn new_connection_replaces_previous_one() {
    let gw = spawn_gateway(30).await;
    let mut first = connect(gw.addr, "42", &token_for(42)).await.unwrap();
    eventually!(gw.state.registry.local_connections() == 1);
    let first_conn = gw.state.registry.local(42).unwrap().conn_id;

    let _second = connect(gw.addr, "42", &token_for(42)).await.unwrap();
    eventually!(gw
        .state
        .registry
        .local(42)
        .is_some_and(|handle| handle.conn_id != first_conn));

    loop {
        match tokio::time::timeout(Duration::from_secs(3), first.next())
            .await
            .expect("evicted session was not closed")
        {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        }
    }

    eventually!(gw.store.connections(42).await.len() == 1);
    assert_eq!(gw.state.registry.local_connections(), 1);
    assert_ne!(gw.store.connections(42).await[0].conn_id, first_conn);
}

#[tokio::test]
async fn idle_session_is_closed_after_heartbeat_timeout() {
    let gw = spawn_gateway(1).await;
    let _client = connect(gw.addr, "42", &token_for(42)).await.unwrap();
    eventually!(gw.state.registry.local_connections() == 1);

    eventually!(gw.state.registry.local_connections() == 0);
    assert!(gw.store.connections(42).await.is_empty());
}

#[tokio::test]
async fn online_status_and_health_endpoints() {
    let gw = spawn_gateway(30).await;
    let _client = connect(gw.addr, "42", &token_for(42)).await.unwrap();
    eventually!(gw.state.registry.local_connections() == 1);

    let http = reqwest::Client::new();
    let url = format!("http://{}/api/v1/online-status", gw.addr);

    let response = http
        .post(&url)
        .json(&json!({ "user_ids": [42, 7, 42] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "status": { "42": true, "7": false } }));

    let empty: Value = http
        .post(&url)
        .json(&json!({ "user_ids": [] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(empty, json!({ "status": {} }));

    let health: Value = http
        .get(format!("http://{}/healthz", gw.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["gateway_id"], "gw-it");
    assert_eq!(health["connections"], 1);

    let metrics = http
        .get(format!("http://{}/metrics", gw.addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("gateway_connections_active"));
}

#[tokio::test]
async fn bootstrap_builds_context_from_config() {
    let app = parse_config(
        r#"
        [services.access_gateway]
        gateway_id = "gw-boot"
        token_secret = "s3cret"

        [discovery.static_endpoints]
        flare-message-service = ["127.0.0.1:50081"]
        "#,
    )
    .unwrap();

    let context = ApplicationBootstrap::create_context(&app).await.unwrap();

    assert_eq!(context.config.gateway_id, "gw-boot");
    assert_eq!(context.state.registry.local_connections(), 0);
    let instances = context
        .discovery
        .get_all_service_instances(MESSAGE_SERVICE)
        .await
        .unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].grpc_endpoint(), "http://127.0.0.1:50081");
}

#[tokio::test]
async fn shutdown_drains_live_sessions() {
    let gw = spawn_gateway(30).await;
    let mut client = connect(gw.addr, "42", &token_for(42)).await.unwrap();
    eventually!(gw.state.registry.local_connections() == 1);

    gw.state.registry.shutdown().await;

    assert_eq!(gw.state.registry.local_connections(), 0);
    assert!(gw.store.connections(42).await.is_empty());
    loop {
        match tokio::time::timeout(Duration::from_secs(3), client.next())
            .await
            .expect("session was not closed")
        {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(_)) => {}
        }
    }
}
