//! Client side of the rendezvous tracker: publish our own address and fetch
//! the addresses of other active peers.

use std::collections::HashMap;
use std::fmt::Debug;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::DiscoveryError;
use crate::models::peer::PeerId;

/// Peers that have not registered for this long are dropped by the tracker.
pub const TRACKER_PEER_EXPIRY: Duration = Duration::from_secs(300);

/// Body of a registration request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRegistration {
    pub peer_id: PeerId,
    pub ip: String,
    pub port: u16,
}

/// A tracker's view of one peer. Only eventually accurate: a listed peer may
/// already be gone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub ip: String,

    #[serde(deserialize_with = "port_from_number_or_string")]
    pub port: u16,

    /// Seconds since the Unix epoch, if the tracker reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<f64>,
}

fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// The two verbs the node needs from a rendezvous service.
#[async_trait]
pub trait Tracker: Debug + Send + Sync {
    async fn register(&self, registration: &PeerRegistration) -> Result<(), DiscoveryError>;

    async fn list_peers(&self) -> Result<Vec<PeerRecord>, DiscoveryError>;
}

#[derive(Deserialize)]
struct StatusReply {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct PeerListReply {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    peers: Vec<PeerRecord>,
}

fn check_status(status: &str, message: Option<String>) -> Result<(), DiscoveryError> {
    if status == "success" {
        Ok(())
    } else {
        Err(DiscoveryError::Rejected(
            message.unwrap_or_else(|| format!("status `{status}`")),
        ))
    }
}

/// Tracker reached over HTTP: `POST /submit-info` and `GET /get-list`.
#[derive(Clone, Debug)]
pub struct HttpTracker {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: format!("http://{host}:{port}"),
            client,
        })
    }

    async fn read_body(response: reqwest::Response) -> Result<String, DiscoveryError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DiscoveryError::Rejected(format!("{status} {body}")));
        }
        Ok(body)
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn register(&self, registration: &PeerRegistration) -> Result<(), DiscoveryError> {
        let url = format!("{}/submit-info", self.base_url);
        let response = self.client.post(&url).json(registration).send().await?;
        let body = Self::read_body(response).await?;
        let reply: StatusReply = serde_json::from_str(&body)
            .map_err(|err| DiscoveryError::Malformed(err.to_string()))?;
        check_status(&reply.status, reply.message)?;

        debug!(
            "Registered {} at {}:{} with tracker {}",
            registration.peer_id, registration.ip, registration.port, self.base_url
        );
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<PeerRecord>, DiscoveryError> {
        let url = format!("{}/get-list", self.base_url);
        let response = self.client.get(&url).send().await?;
        let body = Self::read_body(response).await?;
        let reply: PeerListReply = serde_json::from_str(&body)
            .map_err(|err| DiscoveryError::Malformed(err.to_string()))?;
        check_status(&reply.status, reply.message)?;

        debug!("Tracker {} lists {} peers", self.base_url, reply.peers.len());
        Ok(reply.peers)
    }
}

/// In-process tracker with the same contract, including expiry of peers
/// that have not registered recently.
#[derive(Debug)]
pub struct InMemoryTracker {
    expiry: Duration,
    peers: Mutex<HashMap<PeerId, (PeerRegistration, SystemTime)>>,
}

impl Default for InMemoryTracker {
    fn default() -> Self {
        Self::with_expiry(TRACKER_PEER_EXPIRY)
    }
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expiry(expiry: Duration) -> Self {
        Self {
            expiry,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Drop a peer as if it had expired.
    pub async fn forget(&self, peer_id: &PeerId) -> bool {
        self.peers.lock().await.remove(peer_id).is_some()
    }
}

#[async_trait]
impl Tracker for InMemoryTracker {
    async fn register(&self, registration: &PeerRegistration) -> Result<(), DiscoveryError> {
        if registration.peer_id.is_empty() || registration.ip.is_empty() || registration.port == 0
        {
            return Err(DiscoveryError::Rejected(
                "Missing peer information".to_owned(),
            ));
        }

        self.peers.lock().await.insert(
            registration.peer_id.clone(),
            (registration.clone(), SystemTime::now()),
        );
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<PeerRecord>, DiscoveryError> {
        let now = SystemTime::now();
        let mut peers = self.peers.lock().await;
        peers.retain(|_, (_, last_seen)| {
            now.duration_since(*last_seen).unwrap_or_default() <= self.expiry
        });

        let mut records: Vec<PeerRecord> = peers
            .values()
            .map(|(registration, last_seen)| PeerRecord {
                peer_id: registration.peer_id.clone(),
                ip: registration.ip.clone(),
                port: registration.port,
                last_seen: last_seen
                    .duration_since(UNIX_EPOCH)
                    .ok()
                    .map(|since_epoch| since_epoch.as_secs_f64()),
            })
            .collect();
        records.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        Ok(records)
    }
}

/// The IP this node asks others to dial: an explicit advertise address, else
/// the listen address if it is specific, else the address of the interface
/// used for outbound traffic, else loopback.
pub async fn resolve_advertised_ip(advertise_ip: Option<IpAddr>, listen_addr: IpAddr) -> IpAddr {
    if let Some(ip) = advertise_ip {
        return ip;
    }
    if !listen_addr.is_unspecified() {
        return listen_addr;
    }

    match outbound_interface_ip().await {
        Some(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

/// Connecting a UDP socket selects a route without sending anything.
async fn outbound_interface_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).await.ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod discovery_tests {
    use assert2::check;
    use assert2::let_assert;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tracing_test::traced_test;

    use super::*;

    /// Answer exactly one HTTP request with `body`; resolves to the raw
    /// request text.
    async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (u16, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "{status_line}\r\n\
                 Content-Type: application/json\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (port, handle)
    }

    fn tracker(port: u16) -> HttpTracker {
        HttpTracker::new("127.0.0.1", port, Duration::from_secs(5)).unwrap()
    }

    #[traced_test]
    #[tokio::test]
    async fn http_register_posts_registration() {
        let (port, request) = serve_once(
            "HTTP/1.1 200 OK",
            r#"{"status":"success","message":"Peer registered successfully","peer_id":"alice"}"#,
        )
        .await;

        let registration = PeerRegistration {
            peer_id: PeerId::from("alice"),
            ip: "10.0.0.7".to_owned(),
            port: 9001,
        };
        tracker(port).register(&registration).await.unwrap();

        let request = request.await.unwrap();
        check!(request.starts_with("POST /submit-info "));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let sent: PeerRegistration = serde_json::from_str(body).unwrap();
        check!(sent == registration);
    }

    #[traced_test]
    #[tokio::test]
    async fn http_list_accepts_numeric_and_string_ports() {
        let (port, request) = serve_once(
            "HTTP/1.1 200 OK",
            r#"{"status":"success","count":2,"peers":[
                {"peer_id":"bob","ip":"10.0.0.2","port":9002},
                {"peer_id":"carol","ip":"10.0.0.3","port":"9003"}
            ]}"#,
        )
        .await;

        let peers = tracker(port).list_peers().await.unwrap();
        check!(request.await.unwrap().starts_with("GET /get-list "));
        check!(peers.len() == 2);
        check!(peers[0].peer_id == PeerId::from("bob"));
        check!(peers[0].port == 9002);
        check!(peers[1].port == 9003);
        check!(peers[1].last_seen.is_none());
    }

    #[traced_test]
    #[tokio::test]
    async fn http_error_status_is_rejected() {
        let (port, _request) = serve_once(
            "HTTP/1.1 200 OK",
            r#"{"status":"error","message":"Missing peer information"}"#,
        )
        .await;
        let registration = PeerRegistration {
            peer_id: PeerId::from("alice"),
            ip: String::new(),
            port: 9001,
        };
        let_assert!(
            Err(DiscoveryError::Rejected(reason)) = tracker(port).register(&registration).await
        );
        check!(reason == "Missing peer information");
    }

    #[traced_test]
    #[tokio::test]
    async fn http_malformed_reply() {
        let (port, _request) = serve_once("HTTP/1.1 200 OK", "<html>nope</html>").await;
        let_assert!(Err(DiscoveryError::Malformed(_)) = tracker(port).list_peers().await);

        let (port, _request) =
            serve_once("HTTP/1.1 500 Internal Server Error", r#"{"status":"error"}"#).await;
        let_assert!(Err(DiscoveryError::Rejected(_)) = tracker(port).list_peers().await);
    }

    #[traced_test]
    #[tokio::test]
    async fn http_unreachable_tracker() {
        // bind and drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let_assert!(Err(DiscoveryError::Request(_)) = tracker(port).list_peers().await);
    }

    #[tokio::test]
    async fn in_memory_tracker_registers_and_lists() {
        let tracker = InMemoryTracker::new();
        for (name, port) in [("carol", 9003), ("bob", 9002), ("bob", 9012)] {
            tracker
                .register(&PeerRegistration {
                    peer_id: PeerId::from(name),
                    ip: "127.0.0.1".to_owned(),
                    port,
                })
                .await
                .unwrap();
        }

        let peers = tracker.list_peers().await.unwrap();
        let listed: Vec<(String, u16)> = peers
            .iter()
            .map(|p| (p.peer_id.to_string(), p.port))
            .collect();
        check!(listed == vec![("bob".to_owned(), 9012), ("carol".to_owned(), 9003)]);
        check!(peers.iter().all(|p| p.last_seen.is_some()));

        check!(tracker.forget(&PeerId::from("bob")).await);
        check!(tracker.list_peers().await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn in_memory_tracker_expires_and_validates() {
        let tracker = InMemoryTracker::with_expiry(Duration::ZERO);
        tracker
            .register(&PeerRegistration {
                peer_id: PeerId::from("bob"),
                ip: "127.0.0.1".to_owned(),
                port: 9002,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        check!(tracker.list_peers().await.unwrap().is_empty());

        let_assert!(
            Err(DiscoveryError::Rejected(_)) = tracker
                .register(&PeerRegistration {
                    peer_id: PeerId::from(""),
                    ip: "127.0.0.1".to_owned(),
                    port: 9002,
                })
                .await
        );
    }

    #[tokio::test]
    async fn advertised_ip_preference() {
        let explicit: IpAddr = "192.0.2.1".parse().unwrap();
        let listen: IpAddr = "127.0.0.1".parse().unwrap();
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

        check!(resolve_advertised_ip(Some(explicit), any).await == explicit);
        check!(resolve_advertised_ip(None, listen).await == listen);
        check!(!resolve_advertised_ip(None, any).await.is_unspecified());
    }

    #[test]
    fn peer_record_rejects_bad_port() {
        let_assert!(
            Err(_) = serde_json::from_str::<PeerRecord>(
                r#"{"peer_id":"bob","ip":"10.0.0.2","port":"http"}"#
            )
        );
    }
}
