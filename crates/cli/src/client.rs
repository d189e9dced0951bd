//! Registration server client

use anyhow::{bail, Context, Result};
use elvisp_common::{Allocation, ErrorCode, PublicKey, Request, Response};
use futures::{SinkExt, StreamExt};
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;

/// How long to wait for a response line
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Error answered by the server
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ServerError {
    pub code: ErrorCode,
    pub message: String,
}

/// Client for communicating with the elvisp daemon
pub struct DaemonClient {
    addr: String,
    framed: Framed<TcpStream, LinesCodec>,
}

impl DaemonClient {
    /// Connect to the daemon
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("cannot connect to {}", addr))?;
        Ok(Self {
            addr: addr.to_string(),
            framed: Framed::new(stream, LinesCodec::new()),
        })
    }

    /// Send one request and wait for its response.
    ///
    /// Error responses are returned as [`ServerError`].
    pub async fn call(&mut self, request: &Request) -> Result<Response> {
        debug!("-> {} {:?}", self.addr, request);
        self.framed.send(serde_json::to_string(request)?).await?;

        let line = tokio::time::timeout(RESPONSE_TIMEOUT, self.framed.next())
            .await
            .with_context(|| format!("no response from {}", self.addr))?
            .with_context(|| format!("{} closed the connection", self.addr))??;

        let response: Response =
            serde_json::from_str(&line).with_context(|| format!("invalid response: {}", line))?;
        debug!("<- {} {:?}", self.addr, response);

        match response {
            Response::Error { code, message } => Err(ServerError { code, message }.into()),
            response => Ok(response),
        }
    }

    /// Check if the daemon is healthy; returns its version
    pub async fn ping(&mut self) -> Result<String> {
        match self.call(&Request::Ping).await? {
            Response::Pong { version } => Ok(version),
            other => bail!("unexpected response: {:?}", other),
        }
    }

    // Client operations

    /// Request or renew an address; also returns the key to tunnel to
    pub async fn register(
        &mut self,
        password: &str,
        public_key: PublicKey,
        preferred: Option<IpAddr>,
    ) -> Result<(Allocation, String)> {
        let request = Request::Register {
            password: password.to_string(),
            public_key,
            preferred,
        };
        match self.call(&request).await? {
            Response::Allocated {
                allocation,
                server_key,
            } => Ok((allocation, server_key)),
            other => bail!("unexpected response: {:?}", other),
        }
    }

    /// Look up the current lease
    pub async fn lease(
        &mut self,
        password: &str,
        public_key: PublicKey,
    ) -> Result<(Allocation, String)> {
        let request = Request::Lease {
            password: password.to_string(),
            public_key,
        };
        match self.call(&request).await? {
            Response::Lease {
                allocation,
                server_key,
            } => Ok((allocation, server_key)),
            other => bail!("unexpected response: {:?}", other),
        }
    }

    /// Give up the current lease
    pub async fn release(&mut self, password: &str, public_key: PublicKey) -> Result<Allocation> {
        let request = Request::Release {
            password: password.to_string(),
            public_key,
        };
        match self.call(&request).await? {
            Response::Released { allocation } => Ok(allocation),
            other => bail!("unexpected response: {:?}", other),
        }
    }

    // Administrative operations

    /// Remove a client's allocation
    pub async fn revoke(&mut self, admin_password: &str, public_key: PublicKey) -> Result<Allocation> {
        let request = Request::Revoke {
            admin_password: admin_password.to_string(),
            public_key,
        };
        match self.call(&request).await? {
            Response::Released { allocation } => Ok(allocation),
            other => bail!("unexpected response: {:?}", other),
        }
    }

    /// List all allocations
    pub async fn list(&mut self, admin_password: &str) -> Result<Vec<Allocation>> {
        let request = Request::List {
            admin_password: admin_password.to_string(),
        };
        match self.call(&request).await? {
            Response::Allocations { allocations } => Ok(allocations),
            other => bail!("unexpected response: {:?}", other),
        }
    }

    /// Schedule a reconciliation; returns true if it was folded into one
    /// already queued
    pub async fn reload(&mut self, admin_password: &str) -> Result<bool> {
        let request = Request::Reload {
            admin_password: admin_password.to_string(),
        };
        match self.call(&request).await? {
            Response::ReloadScheduled { coalesced } => Ok(coalesced),
            other => bail!("unexpected response: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Answers every request with the given response lines, in order
    async fn fake_server(responses: Vec<Response>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LinesCodec::new());
            for response in responses {
                let line = framed.next().await.unwrap().unwrap();
                serde_json::from_str::<Request>(&line).unwrap();
                framed
                    .send(serde_json::to_string(&response).unwrap())
                    .await
                    .unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_ping_and_errors() {
        let addr = fake_server(vec![
            Response::Pong {
                version: "1.2.3".to_string(),
            },
            Response::error(ErrorCode::Unauthorized, "Unauthorized"),
        ])
        .await;

        let mut client = DaemonClient::connect(&addr).await.unwrap();
        assert_eq!(client.ping().await.unwrap(), "1.2.3");

        let err = client.list("wrong").await.unwrap_err();
        let server_error = err.downcast_ref::<ServerError>().unwrap();
        assert_eq!(server_error.code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_unexpected_response() {
        let addr = fake_server(vec![Response::ReloadScheduled { coalesced: true }]).await;
        let mut client = DaemonClient::connect(&addr).await.unwrap();
        assert!(client.ping().await.is_err());
    }
}
