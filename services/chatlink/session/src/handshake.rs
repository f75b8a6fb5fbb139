//! Login and post-login sync over JSON request bodies.
//!
//! `PasswordLogin` performs the `login` exchange and maps the server's status
//! onto [`AuthError`]. `ContactSync` fetches the friend and group lists once
//! the session is authenticated.

use crate::components::{LoginProcessor, SyncProcessor};
use crate::error::{AuthError, LinkError};
use crate::listener::Exchange;
use async_trait::async_trait;
use chatlink_wire::Packet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Protocol identifier sent with every login
pub const PROTOCOL_VERSION: &str = "chatlink/1";

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    account: &'a str,
    password: &'a str,
    protocol: &'a str,
    client: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum LoginStatus {
    Ok,
    WrongPassword,
    Banned,
    UnsupportedProtocol,
    RetryLater,
    #[serde(other)]
    Rejected,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    status: LoginStatus,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct LogoutRequest<'a> {
    account: &'a str,
}

/// Account/password login
#[derive(Clone)]
pub struct PasswordLogin {
    account: String,
    password: String,
    timeout: Duration,
}

impl PasswordLogin {
    /// Log in as `account`, waiting up to `timeout` for the server's answer
    pub fn new(account: impl Into<String>, password: impl Into<String>, timeout: Duration) -> Self {
        Self {
            account: account.into(),
            password: password.into(),
            timeout,
        }
    }

    /// Account name
    pub fn account(&self) -> &str {
        &self.account
    }
}

impl fmt::Debug for PasswordLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordLogin")
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, LinkError> {
    serde_json::to_vec(value).map_err(|e| LinkError::unrecoverable(format!("failed to encode request: {}", e)))
}

#[async_trait]
impl LoginProcessor for PasswordLogin {
    async fn login(&self, exchange: &Exchange) -> Result<(), LinkError> {
        let body = encode_json(&LoginRequest {
            account: &self.account,
            password: &self.password,
            protocol: PROTOCOL_VERSION,
            client: concat!("chatlink/", env!("CARGO_PKG_VERSION")),
        })?;

        debug!("Logging in as {}", self.account);
        let request = Packet::request("login", exchange.next_sequence(), body);
        let response = exchange.send_and_expect(request, self.timeout).await?;

        let response: LoginResponse = serde_json::from_slice(&response.body)
            .map_err(|e| LinkError::unrecoverable(format!("malformed login response: {}", e)))?;

        let message = response.message;
        match response.status {
            LoginStatus::Ok => {
                info!("Logged in as {}", self.account);
                Ok(())
            }
            LoginStatus::WrongPassword => Err(AuthError::WrongPassword(message).into()),
            LoginStatus::Banned => Err(AuthError::Banned(message).into()),
            LoginStatus::UnsupportedProtocol => Err(AuthError::UnsupportedProtocol(message).into()),
            LoginStatus::RetryLater => Err(AuthError::RetryLater(message).into()),
            LoginStatus::Rejected => Err(AuthError::Rejected(message).into()),
        }
    }

    async fn logout(&self, exchange: &Exchange) -> Result<(), LinkError> {
        let body = encode_json(&LogoutRequest { account: &self.account })?;
        let request = Packet::request("logout", exchange.next_sequence(), body);
        exchange.send_without_expect(&request).await?;
        info!("Logged out {}", self.account);
        Ok(())
    }
}

/// A friend entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Account id
    pub id: u64,
    /// Display name
    #[serde(default)]
    pub name: String,
}

/// A group entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group id
    pub id: u64,
    /// Group name
    #[serde(default)]
    pub name: String,
    /// Number of members
    #[serde(default)]
    pub members: u32,
}

/// Result of a `session.sync` exchange
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    /// Friends
    #[serde(default)]
    pub friends: Vec<Contact>,
    /// Groups
    #[serde(default)]
    pub groups: Vec<Group>,
}

/// Fetches contacts and groups after every login
#[derive(Debug)]
pub struct ContactSync {
    timeout: Duration,
    latest: Mutex<Option<SyncSnapshot>>,
}

impl ContactSync {
    /// Wait up to `timeout` for the sync response
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            latest: Mutex::new(None),
        }
    }

    /// Snapshot from the most recent successful sync
    pub fn latest(&self) -> Option<SyncSnapshot> {
        self.latest
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SyncProcessor for ContactSync {
    async fn sync(&self, exchange: &Exchange) -> Result<(), LinkError> {
        let request = Packet::request("session.sync", exchange.next_sequence(), &b"{}"[..]);
        let response = exchange.send_and_expect(request, self.timeout).await?;
        let snapshot: SyncSnapshot = serde_json::from_slice(&response.body)
            .map_err(|e| LinkError::unrecoverable(format!("malformed sync response: {}", e)))?;

        info!(
            "Synchronized {} friends and {} groups",
            snapshot.friends.len(),
            snapshot.groups.len()
        );
        *self.latest.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Disposition;
    use crate::testing::{exchange_with, MemoryTransport};
    use bytes::Bytes;

    fn login_server(status: &'static str) -> std::sync::Arc<MemoryTransport> {
        MemoryTransport::with_responder(move |packet| {
            (packet.command == "login").then(|| {
                let request: serde_json::Value = serde_json::from_slice(&packet.body).unwrap();
                assert_eq!(request["protocol"], PROTOCOL_VERSION);
                let body = format!(r#"{{"status":"{}","message":"from server"}}"#, status);
                Packet::response_to(packet, Bytes::from(body))
            })
        })
    }

    #[tokio::test]
    async fn test_login_success() {
        let exchange = exchange_with(&login_server("ok")).await;
        let login = PasswordLogin::new("alice", "secret", Duration::from_secs(5));
        login.login(&exchange).await.unwrap();
    }

    #[tokio::test]
    async fn test_login_statuses_map_to_auth_errors() {
        let cases = [
            ("wrong_password", AuthError::WrongPassword("from server".into())),
            ("banned", AuthError::Banned("from server".into())),
            ("unsupported_protocol", AuthError::UnsupportedProtocol("from server".into())),
            ("retry_later", AuthError::RetryLater("from server".into())),
            ("captcha_required", AuthError::Rejected("from server".into())),
        ];

        for (status, expected) in cases {
            let exchange = exchange_with(&login_server(status)).await;
            let login = PasswordLogin::new("alice", "secret", Duration::from_secs(5));
            assert_eq!(login.login(&exchange).await, Err(LinkError::Auth(expected)));
        }
    }

    #[tokio::test]
    async fn test_malformed_login_response_is_unrecoverable() {
        let transport = MemoryTransport::with_responder(|packet| {
            Some(Packet::response_to(packet, Bytes::from_static(b"not json")))
        });
        let exchange = exchange_with(&transport).await;
        let login = PasswordLogin::new("alice", "secret", Duration::from_secs(5));

        let error = login.login(&exchange).await.unwrap_err();
        assert_eq!(error.disposition(), Disposition::Unrecoverable);
    }

    #[tokio::test]
    async fn test_logout_does_not_wait() {
        let transport = MemoryTransport::silent();
        let exchange = exchange_with(&transport).await;
        let login = PasswordLogin::new("alice", "secret", Duration::from_secs(5));

        login.logout(&exchange).await.unwrap();
        assert_eq!(transport.connection(0).sent_commands(), vec!["logout"]);
    }

    #[test]
    fn test_debug_hides_password() {
        let login = PasswordLogin::new("alice", "secret", Duration::from_secs(5));
        let printed = format!("{:?}", login);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("secret"));
    }

    #[tokio::test]
    async fn test_contact_sync_keeps_snapshot() {
        let transport = MemoryTransport::with_responder(|packet| {
            let body = r#"{"friends":[{"id":1,"name":"bob"}],"groups":[{"id":9,"name":"rustaceans","members":40}]}"#;
            Some(Packet::response_to(packet, Bytes::from_static(body.as_bytes())))
        });
        let exchange = exchange_with(&transport).await;
        let sync = ContactSync::new(Duration::from_secs(5));
        assert_eq!(sync.latest(), None);

        sync.sync(&exchange).await.unwrap();
        let snapshot = sync.latest().unwrap();
        assert_eq!(snapshot.friends, vec![Contact { id: 1, name: "bob".into() }]);
        assert_eq!(snapshot.groups[0].members, 40);
    }
}
