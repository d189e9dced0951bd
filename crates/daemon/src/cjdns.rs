//! cjdns admin API client
//!
//! Bencoded datagrams over UDP. Every authenticated call fetches a fresh
//! cookie, then sends the query hashed with the admin password.

use crate::bencode::{self, Value};
use crate::control::TunnelControl;
use crate::credentials::AdminCredentials;
use async_trait::async_trait;
use elvisp_common::{Error, LiveTunnel, PublicKey, Result, TunnelBinding};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Largest datagram the admin port sends
const MAX_DATAGRAM: usize = 64 * 1024;

/// Admin API client for the local cjdns instance
pub struct CjdnsAdmin {
    endpoint: String,
    password: String,
    timeout: Duration,
    socket: Mutex<Option<UdpSocket>>,
}

impl CjdnsAdmin {
    /// Create a client (does not connect)
    pub fn new(admin: &AdminCredentials, timeout: Duration) -> Self {
        Self {
            endpoint: admin.endpoint(),
            password: admin.password.clone(),
            timeout,
            socket: Mutex::new(None),
        }
    }

    /// Call an admin function with authentication
    pub async fn call(&self, function: &str, args: Value) -> Result<Value> {
        let mut guard = self.socket.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let socket = guard
            .as_ref()
            .ok_or_else(|| Error::Internal("admin socket missing".to_string()))?;

        let result = self.authenticated_call(socket, function, args).await;
        if matches!(result, Err(ref e) if e.is_transient()) {
            // Rebind on the next call; cjdns may have restarted
            *guard = None;
        }
        result
    }

    async fn connect(&self) -> Result<UdpSocket> {
        let bind = if self.endpoint.starts_with('[') {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(&self.endpoint).await.map_err(|e| {
            Error::DaemonUnreachable(format!("cannot reach {}: {}", self.endpoint, e))
        })?;
        debug!("Connected to cjdns admin at {}", self.endpoint);
        Ok(socket)
    }

    async fn authenticated_call(
        &self,
        socket: &UdpSocket,
        function: &str,
        args: Value,
    ) -> Result<Value> {
        let cookie_reply = self
            .exchange(socket, Value::dict([("q", Value::str("cookie"))]))
            .await?;
        let cookie = cookie_reply
            .get("cookie")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("cookie reply without cookie".to_string()))?
            .to_string();

        let query = auth_query(&self.password, &cookie, function, args);
        let reply = self.exchange(socket, query).await?;

        match reply.get("error").and_then(Value::as_str) {
            None | Some("none") => Ok(reply),
            Some(error) => Err(Error::Protocol(format!("{}: {}", function, error))),
        }
    }

    /// Send one query and wait for the reply carrying the same txid
    async fn exchange(&self, socket: &UdpSocket, mut query: Value) -> Result<Value> {
        let txid = hex::encode(rand::random::<[u8; 8]>());
        query.insert("txid", Value::str(&txid));
        let packet = bencode::encode(&query);
        trace!("cjdns admin query: {}", String::from_utf8_lossy(&packet));

        socket.send(&packet).await.map_err(|e| {
            Error::DaemonUnreachable(format!("send to {} failed: {}", self.endpoint, e))
        })?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => len,
                Ok(Err(e)) => {
                    return Err(Error::DaemonUnreachable(format!(
                        "receive from {} failed: {}",
                        self.endpoint, e
                    )))
                }
                Err(_) => {
                    return Err(Error::Timeout {
                        millis: self.timeout.as_millis() as u64,
                    })
                }
            };

            let reply = match bencode::decode(&buf[..len]) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Ignoring undecodable admin reply: {}", e);
                    continue;
                }
            };
            if reply.get("txid").and_then(Value::as_str) == Some(txid.as_str()) {
                return Ok(reply);
            }
            trace!("Ignoring admin reply for another txid");
        }
    }

    async fn show_connection(&self, handle: u64) -> Result<Option<TunnelBinding>> {
        let reply = self
            .call(
                "IpTunnel_showConnection",
                Value::dict([("connection", Value::Int(handle as i64))]),
            )
            .await?;
        parse_connection(&reply)
    }
}

/// Build the final authenticated query.
///
/// The first hash is `sha256(password + cookie)`; the whole query is then
/// encoded with it and hashed again to produce the hash that is sent.
pub(crate) fn auth_query(password: &str, cookie: &str, function: &str, args: Value) -> Value {
    let first = hex::encode(Sha256::digest(format!("{}{}", password, cookie).as_bytes()));
    let mut query = Value::dict([
        ("q", Value::str("auth")),
        ("aq", Value::str(function)),
        ("args", args),
        ("cookie", Value::str(cookie)),
        ("hash", Value::str(&first)),
    ]);
    let second = hex::encode(Sha256::digest(bencode::encode(&query)));
    query.insert("hash", Value::str(&second));
    query
}

/// Binding described by an `IpTunnel_showConnection` reply.
///
/// Outgoing connections are tunnels this node opened to someone else and
/// yield `None`, as do connections with no address assigned.
fn parse_connection(reply: &Value) -> Result<Option<TunnelBinding>> {
    if reply.get("outgoing").and_then(Value::as_int).unwrap_or(0) != 0 {
        return Ok(None);
    }

    let key: PublicKey = reply
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol("connection without key".to_string()))?
        .parse()?;

    for (addr_field, prefix_field) in [("ip6Address", "ip6Prefix"), ("ip4Address", "ip4Prefix")] {
        if let Some(text) = reply.get(addr_field).and_then(Value::as_str) {
            let address: IpAddr = text
                .parse()
                .map_err(|_| Error::Protocol(format!("bad {}: {}", addr_field, text)))?;
            let prefix = reply.get(prefix_field).and_then(Value::as_int).unwrap_or(0);
            return Ok(Some(TunnelBinding {
                public_key: key,
                address,
                prefix: u8::try_from(prefix)
                    .map_err(|_| Error::Protocol(format!("bad {}: {}", prefix_field, prefix)))?,
            }));
        }
    }
    Ok(None)
}

#[async_trait]
impl TunnelControl for CjdnsAdmin {
    async fn list(&self) -> Result<Vec<LiveTunnel>> {
        let reply = self.call("IpTunnel_listConnections", Value::dict([])).await?;
        let handles: Vec<u64> = reply
            .get("connections")
            .and_then(Value::as_list)
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_int)
            .filter_map(|h| u64::try_from(h).ok())
            .collect();

        let mut live = Vec::with_capacity(handles.len());
        for handle in handles {
            match self.show_connection(handle).await {
                Ok(Some(binding)) => live.push(LiveTunnel { handle, binding }),
                Ok(None) => {}
                Err(e) if e.is_transient() => return Err(e),
                // Closed since the listing, or not something we can parse
                Err(e) => warn!("Skipping cjdns connection #{}: {}", handle, e),
            }
        }
        Ok(live)
    }

    async fn allow(&self, binding: &TunnelBinding) -> Result<()> {
        let (addr_field, prefix_field) = match binding.address {
            IpAddr::V6(_) => ("ip6Address", "ip6Prefix"),
            IpAddr::V4(_) => ("ip4Address", "ip4Prefix"),
        };
        let args = Value::dict([
            (
                "publicKeyOfAuthorizedNode",
                Value::str(&binding.public_key.to_string()),
            ),
            (addr_field, Value::str(&binding.address.to_string())),
            (prefix_field, Value::Int(binding.prefix as i64)),
        ]);
        self.call("IpTunnel_allowConnection", args).await?;
        debug!("cjdns allowed {}", binding);
        Ok(())
    }

    async fn remove(&self, tunnel: &LiveTunnel) -> Result<()> {
        self.call(
            "IpTunnel_removeConnection",
            Value::dict([("connection", Value::Int(tunnel.handle as i64))]),
        )
        .await?;
        debug!("cjdns removed tunnel #{} {}", tunnel.handle, tunnel.binding);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "cjdns"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const KEY: &str = "lpu15wrt3tb6d8vngq9yh3lr4gmnkuv0rgcd2jwl5rp5v0mhlg30.k";

    #[test]
    fn test_auth_query_hash() {
        let query = auth_query("secret", "12345", "IpTunnel_listConnections", Value::dict([]));

        let mut expected = query.clone();
        let first = hex::encode(Sha256::digest(b"secret12345"));
        expected.insert("hash", Value::str(&first));
        let second = hex::encode(Sha256::digest(bencode::encode(&expected)));

        assert_eq!(query.get("hash").and_then(Value::as_str), Some(second.as_str()));
        assert_eq!(query.get("aq").and_then(Value::as_str), Some("IpTunnel_listConnections"));
        assert_eq!(query.get("q").and_then(Value::as_str), Some("auth"));
    }

    #[test]
    fn test_parse_connection() {
        let reply = Value::dict([
            ("error", Value::str("none")),
            ("key", Value::str(KEY)),
            ("ip6Address", Value::str("2a03:b0c0:2:d0::1c0:f000")),
            ("ip6Prefix", Value::Int(0)),
            ("outgoing", Value::Int(0)),
        ]);
        let binding = parse_connection(&reply).unwrap().unwrap();
        assert_eq!(binding.public_key.to_string(), KEY);
        assert_eq!(binding.address, "2a03:b0c0:2:d0::1c0:f000".parse::<IpAddr>().unwrap());

        let mut outgoing = reply.clone();
        outgoing.insert("outgoing", Value::Int(1));
        assert!(parse_connection(&outgoing).unwrap().is_none());

        let v4 = Value::dict([
            ("key", Value::str(KEY)),
            ("ip4Address", Value::str("10.66.0.3")),
            ("ip4Prefix", Value::Int(28)),
        ]);
        assert_eq!(parse_connection(&v4).unwrap().unwrap().prefix, 28);
    }

    /// Minimal admin endpoint answering cookie and auth queries
    async fn fake_admin(socket: UdpSocket, connections: Vec<(i64, Value)>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let query = bencode::decode(&buf[..len]).unwrap();
            let txid = query.get("txid").cloned().unwrap();
            let mut reply = match query.get("q").and_then(Value::as_str) {
                Some("cookie") => Value::dict([("cookie", Value::str("777"))]),
                _ => match query.get("aq").and_then(Value::as_str) {
                    Some("IpTunnel_listConnections") => Value::dict([
                        ("error", Value::str("none")),
                        (
                            "connections",
                            Value::List(connections.iter().map(|(h, _)| Value::Int(*h)).collect()),
                        ),
                    ]),
                    Some("IpTunnel_showConnection") => {
                        let handle = query
                            .get("args")
                            .and_then(|a| a.get("connection"))
                            .and_then(Value::as_int)
                            .unwrap();
                        connections
                            .iter()
                            .find(|(h, _)| *h == handle)
                            .map(|(_, v)| v.clone())
                            .unwrap()
                    }
                    _ => Value::dict([("error", Value::str("none"))]),
                },
            };
            reply.insert("txid", txid);
            socket.send_to(&bencode::encode(&reply), peer).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_list_against_fake_admin() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let connection = Value::dict([
            ("error", Value::str("none")),
            ("key", Value::str(KEY)),
            ("ip6Address", Value::str("fd00::5")),
            ("ip6Prefix", Value::Int(0)),
            ("outgoing", Value::Int(0)),
        ]);
        tokio::spawn(fake_admin(server, vec![(4, connection)]));

        let admin = AdminCredentials {
            addr: "127.0.0.1".to_string(),
            port,
            password: "pw".to_string(),
            config: PathBuf::new(),
        };
        let client = CjdnsAdmin::new(&admin, Duration::from_secs(2));

        let live = client.list().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].handle, 4);
        assert_eq!(live[0].binding.address, "fd00::5".parse::<IpAddr>().unwrap());

        client.remove(&live[0]).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_skips_unreadable_connections() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let good = Value::dict([
            ("error", Value::str("none")),
            ("key", Value::str(KEY)),
            ("ip6Address", Value::str("fd00::5")),
            ("ip6Prefix", Value::Int(0)),
            ("outgoing", Value::Int(0)),
        ]);
        // Removed between listConnections and showConnection
        let vanished = Value::dict([("error", Value::str("invalid connection"))]);
        let bad_key = Value::dict([
            ("error", Value::str("none")),
            ("key", Value::str("not-a-key.k")),
            ("ip6Address", Value::str("fd00::6")),
            ("outgoing", Value::Int(0)),
        ]);
        tokio::spawn(fake_admin(server, vec![(4, good), (5, vanished), (6, bad_key)]));

        let admin = AdminCredentials {
            addr: "127.0.0.1".to_string(),
            port,
            password: "pw".to_string(),
            config: PathBuf::new(),
        };
        let client = CjdnsAdmin::new(&admin, Duration::from_secs(2));

        let live = client.list().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].handle, 4);
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        // Bound but never read
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let admin = AdminCredentials {
            addr: "127.0.0.1".to_string(),
            port: silent.local_addr().unwrap().port(),
            password: "pw".to_string(),
            config: PathBuf::new(),
        };
        let client = CjdnsAdmin::new(&admin, Duration::from_millis(100));
        let err = client.list().await.unwrap_err();
        assert!(err.is_transient(), "{}", err);
    }
}
