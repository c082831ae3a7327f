//! Full client sessions against an in-process server
//!
//! The server side of every connection is driven by the test: it issues the
//! encryption challenge, recovers the session key with its private RSA key and
//! from then on speaks through its own cipher.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cm_protocol::config::NetworkConfig;
use cm_protocol::core::emsg::{EResult, MsgType, Universe};
use cm_protocol::core::envelope::Envelope;
use cm_protocol::core::multi;
use cm_protocol::core::proto::{CmList, HeartBeat, Logon, LogonResponse};
use cm_protocol::core::registry::{decode_message, RegistryBuilder};
use cm_protocol::discovery::{Directory, Endpoint, MemoryEndpointStore};
use cm_protocol::error::{ProtocolError, Result};
use cm_protocol::protocol::handshake::{EncryptRequest, EncryptResult, UniverseKeys, HANDSHAKE_PROTOCOL_VERSION};
use cm_protocol::protocol::session::ConnectionState;
use cm_protocol::service::{Client, ClientEvent, ClientHandle, EventStream, LogOnDetails};
use cm_protocol::transport::{channel_pair, ChannelDriver, DisconnectReason, FramedChannel, Transport, TransportKind};
use cm_protocol::utils::compression::CompressionKind;
use cm_protocol::utils::crypto::{CipherContext, SESSION_KEY_LEN};
use futures::StreamExt;
use rand_core::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use tokio::sync::mpsc;

const ACCOUNT_ID: u64 = 76_561_197_960_287_930;
const SESSION_ID: i32 = 4242;
const PRIMARY: &str = "10.0.0.1:27017";
const SECONDARY: &str = "10.0.0.2:27017";

/// Hands the server end of every opened channel to the test.
struct InProcessTransport {
    servers: mpsc::UnboundedSender<ChannelDriver>,
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn open(&self, endpoint: &Endpoint) -> Result<FramedChannel> {
        let (channel, driver) = channel_pair(endpoint.address(), 32);
        self.servers.send(driver).expect("test dropped the server queue");
        Ok(channel)
    }
}

struct Server {
    driver: ChannelDriver,
    cipher: Option<CipherContext>,
}

impl Server {
    fn new(driver: ChannelDriver) -> Self {
        Self { driver, cipher: None }
    }

    async fn send(&self, envelope: &Envelope) {
        let plain = envelope.encode();
        let frame = match &self.cipher {
            Some(cipher) => Bytes::from(cipher.encrypt(&plain).unwrap()),
            None => plain,
        };
        self.driver.incoming.send(frame).await.unwrap();
    }

    async fn recv(&mut self) -> Envelope {
        let frame = self.driver.outgoing.recv().await.expect("client closed the channel");
        let plain = match &self.cipher {
            Some(cipher) => Bytes::from(cipher.decrypt(&frame).unwrap()),
            None => frame,
        };
        Envelope::decode(plain).unwrap()
    }

    /// Issue the encryption challenge and return the client's answer.
    async fn challenge(&mut self, challenge: &[u8]) -> Envelope {
        let request = EncryptRequest {
            protocol_version: HANDSHAKE_PROTOCOL_VERSION,
            universe: Universe::Public,
            challenge: challenge.to_vec(),
        };
        self.send(&request.to_envelope()).await;

        let response = self.recv().await;
        assert_eq!(response.msg_type(), MsgType::CHANNEL_ENCRYPT_RESPONSE);
        response
    }

    /// Run the server half of channel setup and switch to encrypted traffic.
    async fn encrypt_channel(&mut self, private: &RsaPrivateKey) {
        let challenge = vec![0x5Au8; 16];
        let response = self.challenge(&challenge).await;
        let response = response.split_payload(8).unwrap();
        let payload = response.payload();
        let sealed = &payload[..payload.len() - 8];
        let plain = private.decrypt(Oaep::new::<Sha1>(), sealed).unwrap();
        assert_eq!(&plain[SESSION_KEY_LEN..], &challenge[..]);
        let key: [u8; SESSION_KEY_LEN] = plain[..SESSION_KEY_LEN].try_into().unwrap();

        self.send(&EncryptResult { result: EResult::OK }.to_envelope()).await;
        self.cipher = Some(CipherContext::new(&key));
    }

    async fn accept_logon(&self, heartbeat_seconds: i32) {
        let mut response = Envelope::proto(
            MsgType::CLIENT_LOG_ON_RESPONSE,
            &LogonResponse {
                eresult: Some(EResult::OK.0),
                out_of_game_heartbeat_seconds: Some(heartbeat_seconds),
                cell_id: Some(7),
                ..LogonResponse::default()
            },
        );
        response.header_mut().set_identity(ACCOUNT_ID, SESSION_ID);
        self.send(&response).await;
    }
}

struct Harness {
    handle: ClientHandle,
    events: EventStream,
    servers: mpsc::UnboundedReceiver<ChannelDriver>,
    private: RsaPrivateKey,
}

impl Harness {
    fn start(auto_reconnect: bool) -> Self {
        Self::start_with(auto_reconnect, &[PRIMARY], |client| client)
    }

    fn start_with(auto_reconnect: bool, seeds: &[&str], customize: impl FnOnce(Client) -> Client) -> Self {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let mut keys = UniverseKeys::new();
        keys.insert(Universe::Public, RsaPublicKey::from(&private));

        let config = NetworkConfig::default_with_overrides(|c| {
            c.client.auto_reconnect = auto_reconnect;
        });
        let directory = Directory::new(
            seeds.iter().map(|s| Endpoint::new(*s, TransportKind::Tcp)).collect(),
            Box::new(MemoryEndpointStore::new()),
        );
        let (servers_tx, servers) = mpsc::unbounded_channel();
        let client = Client::new(config, keys)
            .unwrap()
            .with_transport(Arc::new(InProcessTransport { servers: servers_tx }))
            .with_directory(directory);
        let (handle, events) = customize(client).start();

        Self {
            handle,
            events,
            servers,
            private,
        }
    }

    async fn next_event(&mut self) -> ClientEvent {
        self.events.next().await.expect("event stream ended")
    }

    async fn next_server(&mut self) -> Server {
        Server::new(self.servers.recv().await.expect("no connection opened"))
    }

    /// Connect and finish channel setup.
    async fn encrypted(&mut self) -> Server {
        self.handle.connect().await.unwrap();
        assert!(matches!(self.next_event().await, ClientEvent::Connected { .. }));

        let mut server = self.next_server().await;
        server.encrypt_channel(&self.private).await;
        assert!(matches!(self.next_event().await, ClientEvent::ChannelEncrypted));
        server
    }

    /// Connect, encrypt and log on with the given heartbeat.
    async fn logged_on(&mut self, heartbeat_seconds: i32) -> Server {
        let mut server = self.encrypted().await;
        self.handle.logon(LogOnDetails::new(65_580)).await.unwrap();
        assert_eq!(server.recv().await.msg_type(), MsgType::CLIENT_LOGON);
        server.accept_logon(heartbeat_seconds).await;
        match self.next_event().await {
            ClientEvent::LoggedOn { result, .. } => assert_eq!(result, EResult::OK),
            other => panic!("unexpected {other:?}"),
        }
        server
    }
}

#[tokio::test(start_paused = true)]
async fn test_handshake_logon_and_heartbeat() {
    let mut harness = Harness::start(false);
    let mut server = harness.encrypted().await;

    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.heartbeat_interval, None);

    harness
        .handle
        .logon(LogOnDetails::new(65_580).with_cell_id(7))
        .await
        .unwrap();
    let logon = server.recv().await;
    assert_eq!(logon.msg_type(), MsgType::CLIENT_LOGON);
    let body = logon.decode_body::<Logon>().unwrap();
    assert_eq!(body.protocol_version, Some(65_580));
    assert_eq!(body.password, None);

    server.accept_logon(30).await;
    match harness.next_event().await {
        ClientEvent::LoggedOn {
            result,
            heartbeat_interval,
        } => {
            assert_eq!(result, EResult::OK);
            assert_eq!(heartbeat_interval, Some(Duration::from_secs(30)));
        }
        other => panic!("unexpected {other:?}"),
    }

    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::LoggedOn);
    assert_eq!(status.account_id, Some(ACCOUNT_ID));
    assert_eq!(status.session_id, Some(SESSION_ID));
    assert_eq!(status.heartbeat_interval, Some(Duration::from_secs(30)));

    let before = tokio::time::Instant::now();
    let beat = server.recv().await;
    assert_eq!(beat.msg_type(), MsgType::CLIENT_HEARTBEAT);
    assert!(before.elapsed() >= Duration::from_secs(30));
    assert_eq!(beat.header().account_id(), Some(ACCOUNT_ID));
}

#[tokio::test(start_paused = true)]
async fn test_job_reply_over_encrypted_channel() {
    let mut harness = Harness::start(false);
    let mut server = harness.logged_on(30).await;

    let handle = harness.handle.clone();
    let call = tokio::spawn(async move {
        handle
            .call(Envelope::proto(MsgType(5500), &HeartBeat { send_reply: Some(true) }))
            .await
    });

    let request = server.recv().await;
    assert_eq!(request.msg_type(), MsgType(5500));
    assert!(request.source_job().is_valid());
    assert_eq!(request.header().session_id(), Some(SESSION_ID));

    let reply = request.reply_to(Envelope::proto(MsgType(5501), &HeartBeat::default()));
    server.send(&reply).await;

    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply.msg_type(), MsgType(5501));
    assert_eq!(harness.handle.status().await.unwrap().pending_jobs, 0);
}

#[tokio::test(start_paused = true)]
async fn test_multi_delivers_server_list_and_messages() {
    let mut harness = Harness::start(false);
    let server = harness.encrypted().await;

    let list = Envelope::proto(
        MsgType::CLIENT_CM_LIST,
        &CmList {
            cm_addresses: vec![0x0A00_0002],
            cm_ports: vec![27018],
            cm_websocket_addresses: vec!["cm2.example.net:443".into()],
        },
    );
    let unclaimed = Envelope::proto(MsgType(5600), &HeartBeat::default());
    let packed = multi::pack(&[list, unclaimed], Some(CompressionKind::Gzip)).unwrap();
    server.send(&packed).await;

    assert!(matches!(
        harness.next_event().await,
        ClientEvent::ServerListUpdated { servers: 3 }
    ));
    // nothing claims either message, so both surface in order
    match harness.next_event().await {
        ClientEvent::Message(envelope) => assert_eq!(envelope.msg_type(), MsgType::CLIENT_CM_LIST),
        other => panic!("unexpected {other:?}"),
    }
    match harness.next_event().await {
        ClientEvent::Message(envelope) => assert_eq!(envelope.msg_type(), MsgType(5600)),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_tampered_frame_drops_the_connection() {
    let mut harness = Harness::start(false);
    let server = harness.encrypted().await;

    server
        .driver
        .incoming
        .send(Bytes::from_static(&[0u8; 48]))
        .await
        .unwrap();

    match harness.next_event().await {
        ClientEvent::Disconnected { user_initiated, .. } => assert!(!user_initiated),
        other => panic!("unexpected {other:?}"),
    }
    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.heartbeat_interval, None);
}

#[tokio::test(start_paused = true)]
async fn test_remote_close_reconnects() {
    let mut harness = Harness::start(true);
    let server = harness.logged_on(30).await;

    server.driver.finish(DisconnectReason::RemoteClosed);
    drop(server);

    match harness.next_event().await {
        ClientEvent::Disconnected { reason, user_initiated } => {
            assert_eq!(reason, DisconnectReason::RemoteClosed);
            assert!(!user_initiated);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        harness.next_event().await,
        ClientEvent::Reconnecting { attempt: 1, .. }
    ));
    assert!(matches!(harness.next_event().await, ClientEvent::Connected { .. }));

    let mut server = harness.next_server().await;
    server.encrypt_channel(&harness.private).await;
    assert!(matches!(harness.next_event().await, ClientEvent::ChannelEncrypted));
    // heartbeat belongs to the logged-on session, not the connection
    assert_eq!(harness.handle.status().await.unwrap().heartbeat_interval, None);
}

#[tokio::test(start_paused = true)]
async fn test_user_disconnect_does_not_reconnect() {
    let mut harness = Harness::start(true);
    let _server = harness.logged_on(30).await;

    harness.handle.disconnect().await.unwrap();
    match harness.next_event().await {
        ClientEvent::Disconnected { user_initiated, .. } => assert!(user_initiated),
        other => panic!("unexpected {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(harness.servers.try_recv().is_err());
    assert_eq!(
        harness.handle.status().await.unwrap().state,
        ConnectionState::Disconnected
    );
}

#[tokio::test(start_paused = true)]
async fn test_custom_registry_keeps_session_handling() {
    let registry = RegistryBuilder::new()
        .message(MsgType(5501), decode_message::<HeartBeat>)
        .build();
    let mut harness = Harness::start_with(false, &[PRIMARY], |client| client.with_registry(registry));
    let mut server = harness.encrypted().await;

    harness.handle.logon(LogOnDetails::new(65_580)).await.unwrap();
    assert_eq!(server.recv().await.msg_type(), MsgType::CLIENT_LOGON);
    server.accept_logon(30).await;
    match harness.next_event().await {
        ClientEvent::LoggedOn {
            result,
            heartbeat_interval,
        } => {
            assert_eq!(result, EResult::OK);
            assert_eq!(heartbeat_interval, Some(Duration::from_secs(30)));
        }
        other => panic!("unexpected {other:?}"),
    }
    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::LoggedOn);
    assert_eq!(status.heartbeat_interval, Some(Duration::from_secs(30)));

    let list = Envelope::proto(
        MsgType::CLIENT_CM_LIST,
        &CmList {
            cm_addresses: vec![0x0A00_0002],
            cm_ports: vec![27018],
            cm_websocket_addresses: vec![],
        },
    );
    server.send(&list).await;
    assert!(matches!(
        harness.next_event().await,
        ClientEvent::ServerListUpdated { servers: 2 }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_failed_handshake_reconnects_to_next_server() {
    let mut harness = Harness::start_with(true, &[PRIMARY, SECONDARY], |client| client);

    let endpoint = harness.handle.connect().await.unwrap();
    assert_eq!(endpoint.address(), PRIMARY);
    assert!(matches!(harness.next_event().await, ClientEvent::Connected { .. }));

    let mut server = harness.next_server().await;
    server.challenge(&[0x5Au8; 16]).await;
    server.send(&EncryptResult { result: EResult::FAIL }.to_envelope()).await;

    match harness.next_event().await {
        ClientEvent::Disconnected { reason, user_initiated } => {
            assert!(!user_initiated);
            assert!(matches!(reason, DisconnectReason::Error(_)));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        harness.next_event().await,
        ClientEvent::Reconnecting { attempt: 1, .. }
    ));
    // the failed server is marked bad and tried last
    match harness.next_event().await {
        ClientEvent::Connected { endpoint } => assert_eq!(endpoint.address(), SECONDARY),
        other => panic!("unexpected {other:?}"),
    }

    let mut server = harness.next_server().await;
    server.encrypt_channel(&harness.private).await;
    assert!(matches!(harness.next_event().await, ClientEvent::ChannelEncrypted));
    let metrics = harness.handle.metrics().snapshot();
    assert_eq!(metrics.handshakes_failed, 1);
    assert_eq!(metrics.handshakes_success, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_job_resolves_and_late_reply_surfaces() {
    let mut harness = Harness::start(false);
    let mut server = harness.logged_on(30).await;

    let job = harness
        .handle
        .send_job(Envelope::proto(MsgType(5500), &HeartBeat { send_reply: Some(true) }))
        .await
        .unwrap();
    let job_id = job.job_id();
    let request = server.recv().await;
    assert_eq!(request.source_job(), job_id);
    assert_eq!(harness.handle.status().await.unwrap().pending_jobs, 1);

    assert!(harness.handle.cancel_job(job_id).await.unwrap());
    assert!(!harness.handle.cancel_job(job_id).await.unwrap());
    assert!(matches!(job.await, Err(ProtocolError::JobCancelled(id)) if id == job_id));
    assert_eq!(harness.handle.status().await.unwrap().pending_jobs, 0);

    server
        .send(&request.reply_to(Envelope::proto(MsgType(5501), &HeartBeat::default())))
        .await;
    match harness.next_event().await {
        ClientEvent::Message(envelope) => {
            assert_eq!(envelope.msg_type(), MsgType(5501));
            assert_eq!(envelope.target_job(), job_id);
        }
        other => panic!("unexpected {other:?}"),
    }
}
