//! Integration tests for SSH client-server communication.
//!
//! These tests wire real client and server sessions over localhost TCP and
//! validate the complete protocol flow: identification exchange, key
//! exchange (with host key verification), authentication, channel
//! operations, rekeying and keepalive behavior.

use skiff_platform::{SkiffError, SkiffResult};
use skiff_proto::ssh::client::{AuthOutcome, SshClient, SshClientConfig};
use skiff_proto::ssh::hostkey::{EcdsaP256HostKey, HostKey, RsaHostKey};
use skiff_proto::ssh::keyfile::KeyMaterial;
use skiff_proto::ssh::server::{
    AuthDecision, AuthHandler, SessionHandler, SshServer, SshServerConfig,
};
use skiff_proto::ssh::session::KeepaliveRegistry;
use skiff_proto::ssh::verify_signature;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

/// Test auth policy: one fixed password, plus an allow-listed public key.
struct TestAuth {
    password: &'static str,
    allowed_key: Option<Vec<u8>>,
}

#[async_trait::async_trait]
impl AuthHandler for TestAuth {
    fn methods(&self) -> Vec<String> {
        vec!["password".to_string(), "publickey".to_string()]
    }

    async fn auth_password(&self, user: &str, password: &str) -> AuthDecision {
        if user == "alice" && password == self.password {
            AuthDecision::Accept
        } else {
            AuthDecision::Reject
        }
    }

    async fn offer_publickey(&self, _user: &str, _algorithm: &str, blob: &[u8]) -> bool {
        self.allowed_key.as_deref() == Some(blob)
    }

    async fn auth_publickey(&self, _user: &str, _algorithm: &str, blob: &[u8]) -> AuthDecision {
        if self.allowed_key.as_deref() == Some(blob) {
            AuthDecision::Accept
        } else {
            AuthDecision::Reject
        }
    }
}

/// Test session handler that runs "echo"-style commands.
struct EchoHandler {
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl EchoHandler {
    fn new() -> Self {
        Self {
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait::async_trait]
impl SessionHandler for EchoHandler {
    async fn handle_exec(&mut self, command: &str) -> SkiffResult<Vec<u8>> {
        if let Some(rest) = command.strip_prefix("echo ") {
            Ok(format!("{}\n", rest).into_bytes())
        } else {
            Err(SkiffError::NotImplemented(command.to_string()))
        }
    }

    async fn handle_data(&mut self, _channel: u32, data: &[u8]) -> SkiffResult<()> {
        self.received.lock().unwrap().push(data.to_vec());
        Ok(())
    }
}

fn rsa_host_key() -> Arc<dyn HostKey> {
    Arc::new(RsaHostKey::generate(2048).expect("RSA key generation"))
}

fn ecdsa_host_key() -> Arc<dyn HostKey> {
    Arc::new(EcdsaP256HostKey::generate().expect("ECDSA key generation"))
}

async fn start_server(
    config: SshServerConfig,
    host_key: Arc<dyn HostKey>,
    auth: Arc<dyn AuthHandler>,
) -> (SshServer, String) {
    let server = SshServer::bind("127.0.0.1:0", config, vec![host_key], auth)
        .await
        .expect("bind");
    let addr = format!("127.0.0.1:{}", server.local_addr().unwrap().port());
    (server, addr)
}

/// The full end-to-end scenario: identification, group14 key exchange over
/// an RSA host key, "none" probing, password authentication, then an exec
/// channel delivering data and closing cleanly.
#[tokio::test]
async fn test_end_to_end_password_and_exec() {
    let auth = Arc::new(TestAuth {
        password: "correct horse",
        allowed_key: None,
    });
    let (server, addr) = start_server(SshServerConfig::default(), rsa_host_key(), auth).await;

    let server_task = tokio::spawn(async move {
        let mut session = server.accept().await?;
        session.handshake().await?;
        let user = session.authenticate().await?;
        assert_eq!(user, "alice");
        let mut handler = EchoHandler::new();
        session.serve(&mut handler).await
    });

    // Force the classic group14 exchange for this scenario.
    let mut config = SshClientConfig::default();
    config.algorithms.kex = Some(vec!["diffie-hellman-group14-sha1".to_string()]);

    let mut client = timeout(Duration::from_secs(20), SshClient::connect(&addr, config))
        .await
        .expect("handshake in time")
        .expect("handshake succeeds");

    assert!(client.server_host_key().is_some());
    client.request_userauth().await.unwrap();

    // "none" probes the available methods.
    match client.auth_none("alice").await.unwrap() {
        AuthOutcome::Failure { methods, partial } => {
            assert!(methods.contains(&"password".to_string()));
            assert!(methods.contains(&"publickey".to_string()));
            assert!(!partial);
        }
        other => panic!("expected failure from none auth, got {:?}", other),
    }

    // Wrong password fails, correct password succeeds.
    assert!(matches!(
        client.auth_password("alice", "wrong").await.unwrap(),
        AuthOutcome::Failure { .. }
    ));
    assert_eq!(
        client.auth_password("alice", "correct horse").await.unwrap(),
        AuthOutcome::Success
    );
    assert!(client.is_authenticated());
    assert_eq!(client.username(), Some("alice"));

    // Exec delivers CHANNEL_DATA then the close handshake.
    let output = client.execute("echo hi").await.unwrap();
    assert_eq!(output, b"hi\n");

    client.disconnect().await.unwrap();
    timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server finishes")
        .expect("no join error")
        .expect("clean close");
}

/// ECDH key exchange with an ECDSA host key and public-key authentication
/// (probe phase then signed phase).
#[tokio::test]
async fn test_publickey_auth_over_ecdh() {
    let user_key = KeyMaterial::generate_ecdsa(
        skiff_proto::ssh::hostkey::HostKeyAlgorithm::EcdsaP256,
    )
    .unwrap();

    let auth = Arc::new(TestAuth {
        password: "unused",
        allowed_key: Some(user_key.public_blob().to_vec()),
    });
    let (server, addr) = start_server(SshServerConfig::default(), ecdsa_host_key(), auth).await;

    let server_task = tokio::spawn(async move {
        let mut session = server.accept().await?;
        session.handshake().await?;
        session.authenticate().await
    });

    let mut client = SshClient::connect(&addr, SshClientConfig::default())
        .await
        .unwrap();
    client.request_userauth().await.unwrap();

    assert_eq!(
        client.auth_publickey("alice", &user_key).await.unwrap(),
        AuthOutcome::Success
    );

    let user = timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(user, "alice");
}

/// A public key the server does not know is rejected at the probe phase.
#[tokio::test]
async fn test_unknown_publickey_rejected() {
    let user_key = KeyMaterial::generate_rsa(2048).unwrap();
    let auth = Arc::new(TestAuth {
        password: "unused",
        allowed_key: None,
    });
    let (server, addr) = start_server(SshServerConfig::default(), rsa_host_key(), auth).await;

    tokio::spawn(async move {
        let mut session = server.accept().await?;
        session.handshake().await?;
        let _ = session.authenticate().await;
        Ok::<_, SkiffError>(())
    });

    let mut client = SshClient::connect(&addr, SshClientConfig::default())
        .await
        .unwrap();
    client.request_userauth().await.unwrap();

    assert!(matches!(
        client.auth_publickey("alice", &user_key).await.unwrap(),
        AuthOutcome::Failure { .. }
    ));
}

/// The asynchronous host-key verification checkpoint: a slow verifier that
/// resolves after the server's NEWKEYS has already arrived, and a rejecting
/// verifier that aborts the handshake.
#[tokio::test]
async fn test_host_key_verification_checkpoint() {
    let auth = Arc::new(TestAuth {
        password: "pw",
        allowed_key: None,
    });
    let (server, addr) = start_server(SshServerConfig::default(), rsa_host_key(), auth).await;

    tokio::spawn(async move {
        loop {
            let Ok(mut session) = server.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = session.handshake().await;
                let _ = session.authenticate().await;
            });
        }
    });

    // Slow approval: the verdict lands well after NEWKEYS.
    let seen_fingerprint = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&seen_fingerprint);
    let mut config = SshClientConfig::default();
    config.host_key_verifier = Some(Arc::new(move |info| {
        let seen = Arc::clone(&seen);
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            *seen.lock().unwrap() = Some(info.fingerprint.clone());
            true
        })
    }));

    let client = SshClient::connect(&addr, config).await.unwrap();
    let fingerprint = seen_fingerprint.lock().unwrap().clone().unwrap();
    assert!(fingerprint.starts_with("SHA256:"));
    assert_eq!(client.server_fingerprint(), Some(fingerprint));

    // Rejection is fatal.
    let mut config = SshClientConfig::default();
    config.host_key_verifier = Some(Arc::new(|_| Box::pin(async { false })));
    let result = SshClient::connect(&addr, config).await;
    match result {
        Err(SkiffError::Disconnect { code, message, .. }) => {
            assert_eq!(code, 9); // HOST_KEY_NOT_VERIFIABLE
            assert!(message.contains("verification failed"));
        }
        other => panic!("expected disconnect, got {:?}", other.map(|_| ())),
    }
}

/// Algorithm negotiation failure terminates the connection with a
/// key-exchange error naming the category.
#[tokio::test]
async fn test_negotiation_mismatch_is_fatal() {
    let auth = Arc::new(TestAuth {
        password: "pw",
        allowed_key: None,
    });
    let mut server_config = SshServerConfig::default();
    server_config.algorithms.cipher = Some(vec!["aes256-ctr".to_string()]);
    let (server, addr) = start_server(server_config, rsa_host_key(), auth).await;

    tokio::spawn(async move {
        let mut session = server.accept().await?;
        let _ = session.handshake().await;
        Ok::<_, SkiffError>(())
    });

    let mut config = SshClientConfig::default();
    config.algorithms.cipher = Some(vec!["aes128-gcm@openssh.com".to_string()]);
    let result = SshClient::connect(&addr, config).await;
    match result {
        Err(SkiffError::Disconnect { code, message, .. }) => {
            assert_eq!(code, 3); // KEY_EXCHANGE_FAILED
            assert!(message.contains("cipher"), "message: {}", message);
        }
        other => panic!("expected key exchange failure, got {:?}", other.map(|_| ())),
    }
}

/// Rekey transparency and session-id invariance: two rekeys leave the
/// session identifier untouched, channel traffic issued around the rekeys
/// arrives in order, and the connection keeps working.
#[tokio::test]
async fn test_rekey_preserves_session_id_and_ordering() {
    let auth = Arc::new(TestAuth {
        password: "pw",
        allowed_key: None,
    });
    let (server, addr) = start_server(SshServerConfig::default(), rsa_host_key(), auth).await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_server = Arc::clone(&received);
    let server_task = tokio::spawn(async move {
        let mut session = server.accept().await?;
        session.handshake().await?;
        session.authenticate().await?;
        let mut handler = EchoHandler {
            received: received_server,
        };
        session.serve(&mut handler).await
    });

    let mut client = SshClient::connect(&addr, SshClientConfig::default())
        .await
        .unwrap();
    client.request_userauth().await.unwrap();
    client.auth_password("alice", "pw").await.unwrap();

    let session_id_before = client.session_id().unwrap().to_vec();

    let channel = client.open_session().await.unwrap();
    client.send_channel_data(channel, b"one").await.unwrap();
    client.send_channel_data(channel, b"two").await.unwrap();

    // Two consecutive rekeys.
    client.request_rekey().await.unwrap();
    client.request_rekey().await.unwrap();
    assert_eq!(client.session_id().unwrap(), &session_id_before[..]);

    client.send_channel_data(channel, b"three").await.unwrap();
    client.send_channel_data(channel, b"four").await.unwrap();
    client.send_channel_data(channel, b"five").await.unwrap();

    // The exec exercises the freshly derived keys end to end.
    let output = client.execute("echo rekeyed").await.unwrap();
    assert_eq!(output, b"rekeyed\n");

    client.disconnect().await.unwrap();
    server_task.await.unwrap().unwrap();

    let received = received.lock().unwrap();
    assert_eq!(
        *received,
        vec![
            b"one".to_vec(),
            b"two".to_vec(),
            b"three".to_vec(),
            b"four".to_vec(),
            b"five".to_vec(),
        ]
    );
}

/// Channel ids are reclaimed only after the full close handshake: a second
/// exec may reuse the id of a fully-closed channel.
#[tokio::test]
async fn test_sequential_execs_reuse_channels() {
    let auth = Arc::new(TestAuth {
        password: "pw",
        allowed_key: None,
    });
    let (server, addr) = start_server(SshServerConfig::default(), rsa_host_key(), auth).await;

    tokio::spawn(async move {
        let mut session = server.accept().await?;
        session.handshake().await?;
        session.authenticate().await?;
        let mut handler = EchoHandler::new();
        session.serve(&mut handler).await
    });

    let mut client = SshClient::connect(&addr, SshClientConfig::default())
        .await
        .unwrap();
    client.request_userauth().await.unwrap();
    client.auth_password("alice", "pw").await.unwrap();

    for i in 0..3 {
        let output = client.execute(&format!("echo run{}", i)).await.unwrap();
        assert_eq!(output, format!("run{}\n", i).into_bytes());
    }
    client.disconnect().await.unwrap();
}

/// A client that never answers keepalive probes is disconnected with a
/// client-timeout error and removed from the registry.
#[tokio::test]
async fn test_keepalive_timeout_disconnects_idle_client() {
    let auth = Arc::new(TestAuth {
        password: "pw",
        allowed_key: None,
    });
    let (mut server, addr) = start_server(SshServerConfig::default(), rsa_host_key(), auth).await;

    let registry = KeepaliveRegistry::new(Duration::from_millis(50), 2);
    server.set_keepalive(Arc::clone(&registry));

    let server_task = tokio::spawn(async move {
        let mut session = server.accept().await?;
        session.handshake().await?;
        session.authenticate().await?;
        let mut handler = EchoHandler::new();
        session.serve(&mut handler).await
    });

    let mut client = SshClient::connect(&addr, SshClientConfig::default())
        .await
        .unwrap();
    client.request_userauth().await.unwrap();
    client.auth_password("alice", "pw").await.unwrap();

    // Stop servicing the connection entirely; probes go unanswered.
    let result = timeout(Duration::from_secs(5), server_task)
        .await
        .expect("timeout fires in time")
        .expect("no join error");
    match result {
        Err(SkiffError::Disconnect { message, .. }) => {
            assert!(message.contains("client-timeout"), "message: {}", message);
        }
        other => panic!("expected keepalive disconnect, got {:?}", other.map(|_| ())),
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.is_empty());
}

/// An active client is never timed out: execs keep resetting the idle
/// clock and the probe replies count as activity.
#[tokio::test]
async fn test_keepalive_tolerates_active_client() {
    let auth = Arc::new(TestAuth {
        password: "pw",
        allowed_key: None,
    });
    let (mut server, addr) = start_server(SshServerConfig::default(), rsa_host_key(), auth).await;

    let registry = KeepaliveRegistry::new(Duration::from_millis(80), 3);
    server.set_keepalive(Arc::clone(&registry));

    let finished = Arc::new(AtomicBool::new(false));
    let finished_server = Arc::clone(&finished);
    let server_task = tokio::spawn(async move {
        let mut session = server.accept().await?;
        session.handshake().await?;
        session.authenticate().await?;
        let mut handler = EchoHandler::new();
        let result = session.serve(&mut handler).await;
        finished_server.store(true, Ordering::SeqCst);
        result
    });

    let mut client = SshClient::connect(&addr, SshClientConfig::default())
        .await
        .unwrap();
    client.request_userauth().await.unwrap();
    client.auth_password("alice", "pw").await.unwrap();

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        let output = client.execute("echo ping").await.unwrap();
        assert_eq!(output, b"ping\n");
    }
    assert!(!finished.load(Ordering::SeqCst));

    client.disconnect().await.unwrap();
    timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

/// The server greeting reaches the client as captured free text.
#[tokio::test]
async fn test_server_greeting_and_banner() {
    let auth = Arc::new(TestAuth {
        password: "pw",
        allowed_key: None,
    });
    let mut config = SshServerConfig::default();
    config.greeting = Some("Unauthorized access prohibited".to_string());
    config.banner = Some("All sessions are recorded".to_string());
    let (server, addr) = start_server(config, rsa_host_key(), auth).await;

    tokio::spawn(async move {
        let mut session = server.accept().await?;
        session.handshake().await?;
        session.authenticate().await
    });

    let mut client = SshClient::connect(&addr, SshClientConfig::default())
        .await
        .unwrap();
    assert_eq!(client.server_greeting(), "Unauthorized access prohibited");

    client.request_userauth().await.unwrap();
    client.auth_password("alice", "pw").await.unwrap();
    assert_eq!(client.auth_banner(), Some("All sessions are recorded"));
}

/// GCM transport: the negotiated AEAD cipher carries the whole session.
#[tokio::test]
async fn test_gcm_cipher_session() {
    let auth = Arc::new(TestAuth {
        password: "pw",
        allowed_key: None,
    });
    let (server, addr) = start_server(SshServerConfig::default(), rsa_host_key(), auth).await;

    tokio::spawn(async move {
        let mut session = server.accept().await?;
        session.handshake().await?;
        session.authenticate().await?;
        let mut handler = EchoHandler::new();
        session.serve(&mut handler).await
    });

    let mut config = SshClientConfig::default();
    config.algorithms.cipher = Some(vec!["aes128-gcm@openssh.com".to_string()]);
    let mut client = SshClient::connect(&addr, config).await.unwrap();
    client.request_userauth().await.unwrap();
    client.auth_password("alice", "pw").await.unwrap();

    let output = client.execute("echo sealed").await.unwrap();
    assert_eq!(output, b"sealed\n");
    client.disconnect().await.unwrap();
}

/// The signature a parsed key file produces verifies against its own
/// exported public blob (key codec + signature pipeline together).
#[tokio::test]
async fn test_keyfile_signature_pipeline() {
    let pem = KeyMaterial::generate_rsa(2048)
        .unwrap()
        .export_private_pem()
        .unwrap();
    let key = KeyMaterial::parse(&pem, None).unwrap();
    let signature = key.sign(b"exchange hash bytes").unwrap();
    assert!(verify_signature(key.public_blob(), &signature, b"exchange hash bytes").unwrap());
}
