//! Client listener
//!
//! Newline-delimited JSON over TCP. Each connection runs in its own task and
//! answers requests in order; on shutdown connections stop reading but finish
//! the request in hand.

use crate::config::ServerConfig;
use crate::reconciler::ReloadHandle;
use crate::registry::Registry;
use elvisp_common::{
    Credential, Error, ErrorCode, PublicKey, Request, Response, Result, VERSION,
};
use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Routes decoded requests to the registration service
pub struct Dispatcher {
    registry: Arc<Registry>,
    reload: ReloadHandle,
    server_key: PublicKey,
    verify_peer_address: bool,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        reload: ReloadHandle,
        server_key: PublicKey,
        verify_peer_address: bool,
    ) -> Self {
        Self {
            registry,
            reload,
            server_key,
            verify_peer_address,
        }
    }

    /// Answer one request from `peer`
    pub async fn handle(&self, peer: IpAddr, request: Request) -> Response {
        let op = request.op();
        match self.dispatch(peer, request).await {
            Ok(response) => response,
            Err(e) => {
                match e.code() {
                    ErrorCode::Internal => warn!("{} from {} failed: {}", op, peer, e),
                    _ => debug!("{} from {} rejected: {}", op, peer, e),
                }
                Response::from(e)
            }
        }
    }

    async fn dispatch(&self, peer: IpAddr, request: Request) -> Result<Response> {
        match request {
            Request::Register {
                password,
                public_key,
                preferred,
            } => {
                let credential = self.credential(peer, password, public_key)?;
                let allocation = self.registry.register(&credential, preferred).await?;
                Ok(Response::Allocated {
                    allocation,
                    server_key: self.server_key.to_string(),
                })
            }
            Request::Lease {
                password,
                public_key,
            } => {
                let credential = self.credential(peer, password, public_key)?;
                Ok(Response::Lease {
                    allocation: self.registry.lookup(&credential)?,
                    server_key: self.server_key.to_string(),
                })
            }
            Request::Release {
                password,
                public_key,
            } => {
                let credential = self.credential(peer, password, public_key)?;
                Ok(Response::Released {
                    allocation: self.registry.release(&credential).await?,
                })
            }
            Request::Revoke {
                admin_password,
                public_key,
            } => {
                self.registry.verify_admin(&admin_password)?;
                let allocation = self.registry.revoke(public_key).await?;
                info!("Revoked {} from {}", allocation.address, public_key);
                Ok(Response::Released { allocation })
            }
            Request::List { admin_password } => {
                self.registry.verify_admin(&admin_password)?;
                Ok(Response::Allocations {
                    allocations: self.registry.list(),
                })
            }
            Request::Reload { admin_password } => {
                self.registry.verify_admin(&admin_password)?;
                let scheduled = self.reload.trigger();
                info!("Reload requested by {} (coalesced: {})", peer, !scheduled);
                Ok(Response::ReloadScheduled {
                    coalesced: !scheduled,
                })
            }
            Request::Ping => Ok(Response::Pong {
                version: VERSION.to_string(),
            }),
        }
    }

    fn credential(&self, peer: IpAddr, password: String, public_key: PublicKey) -> Result<Credential> {
        if self.verify_peer_address && peer != IpAddr::V6(public_key.ipv6()) {
            debug!("Peer {} does not own key {}", peer, public_key);
            return Err(Error::Unauthorized);
        }
        Ok(Credential {
            password,
            public_key,
        })
    }
}

/// Accept connections until `shutdown` fires, then wait for open
/// connections to finish their current request
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let tracker = TaskTracker::new();
    info!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };

        debug!("Connection from {}", peer);
        let dispatcher = dispatcher.clone();
        let config = config.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            if let Err(e) = handle_connection(stream, peer, dispatcher, config, shutdown).await {
                debug!("Connection {} closed with error: {}", peer, e);
            }
        });
    }

    tracker.close();
    tracker.wait().await;
    info!("Listener stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(config.max_line_bytes));
    let idle = Duration::from_secs(config.idle_timeout_secs.max(1));

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = tokio::time::timeout(idle, framed.next()) => next,
        };

        let line = match next {
            Err(_) => {
                debug!("Connection {} idle, closing", peer);
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(line))) => line,
            // The framed stream ends after a decode error
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                let response = Response::error(ErrorCode::BadRequest, "request line too long");
                framed.send(serde_json::to_string(&response)?).await.map_err(codec_error)?;
                break;
            }
            Ok(Some(Err(LinesCodecError::Io(e)))) => return Err(e.into()),
        };

        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!("{} <- {:?}", peer, request);
                dispatcher.handle(peer.ip(), request).await
            }
            Err(e) => Response::error(ErrorCode::BadRequest, format!("invalid request: {}", e)),
        };

        framed
            .send(serde_json::to_string(&response)?)
            .await
            .map_err(codec_error)?;
    }
    Ok(())
}

fn codec_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::Io(e) => Error::Io(e),
        other => Error::Protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DaemonConfig, RangeConfig, RetryPolicy};
    use crate::control::MemoryControl;
    use crate::reconciler::{reload_channel, Reconciler};
    use elvisp_common::{AllocationStore, Database};
    use tokio::sync::mpsc;

    const KEY: &str = "lpu15wrt3tb6d8vngq9yh3lr4gmnkuv0rgcd2jwl5rp5v0mhlg30.k";

    fn dispatcher(verify_peer_address: bool) -> (Dispatcher, mpsc::Receiver<()>) {
        let config = DaemonConfig {
            password: "pw".to_string(),
            admin_password: Some("root".to_string()),
            ranges: vec![RangeConfig::Cidr {
                cidr: "10.66.0.0/30".to_string(),
                prefix: None,
            }],
            ..Default::default()
        };
        let store = Arc::new(AllocationStore::open(Database::open_memory().unwrap()).unwrap());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            Arc::new(MemoryControl::new()),
            RetryPolicy::default(),
        ));
        let registry = Arc::new(Registry::open(&config, store, reconciler).unwrap());
        let (reload, rx) = reload_channel();
        let server_key = PublicKey::from_bytes([42; 32]);
        (
            Dispatcher::new(registry, reload, server_key, verify_peer_address),
            rx,
        )
    }

    fn register(password: &str) -> Request {
        Request::Register {
            password: password.to_string(),
            public_key: KEY.parse().unwrap(),
            preferred: None,
        }
    }

    fn local() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_and_lease() {
        let (dispatcher, _rx) = dispatcher(false);

        let allocation = match dispatcher.handle(local(), register("pw")).await {
            Response::Allocated {
                allocation,
                server_key,
            } => {
                assert_eq!(server_key, PublicKey::from_bytes([42; 32]).to_string());
                allocation
            }
            other => panic!("unexpected response {:?}", other),
        };
        assert_eq!(allocation.address, "10.66.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(allocation.prefix, 30);

        let lease = dispatcher
            .handle(
                local(),
                Request::Lease {
                    password: "pw".to_string(),
                    public_key: KEY.parse().unwrap(),
                },
            )
            .await;
        assert!(matches!(lease, Response::Lease { allocation: a, .. } if a == allocation));
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let (dispatcher, _rx) = dispatcher(false);
        let response = dispatcher.handle(local(), register("nope")).await;
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::Unauthorized,
                ..
            }
        ));

        let list = dispatcher
            .handle(
                local(),
                Request::List {
                    admin_password: "pw".to_string(),
                },
            )
            .await;
        assert!(matches!(
            list,
            Response::Error {
                code: ErrorCode::Unauthorized,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_peer_address_verification() {
        let (dispatcher, _rx) = dispatcher(true);
        let response = dispatcher.handle(local(), register("pw")).await;
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::Unauthorized,
                ..
            }
        ));

        let key: PublicKey = KEY.parse().unwrap();
        let response = dispatcher.handle(IpAddr::V6(key.ipv6()), register("pw")).await;
        assert!(matches!(response, Response::Allocated { .. }));
    }

    #[tokio::test]
    async fn test_admin_requests() {
        let (dispatcher, mut rx) = dispatcher(false);
        dispatcher.handle(local(), register("pw")).await;

        let list = dispatcher
            .handle(
                local(),
                Request::List {
                    admin_password: "root".to_string(),
                },
            )
            .await;
        assert!(matches!(list, Response::Allocations { ref allocations } if allocations.len() == 1));

        let reload = || Request::Reload {
            admin_password: "root".to_string(),
        };
        assert_eq!(
            dispatcher.handle(local(), reload()).await,
            Response::ReloadScheduled { coalesced: false }
        );
        assert_eq!(
            dispatcher.handle(local(), reload()).await,
            Response::ReloadScheduled { coalesced: true }
        );
        assert!(rx.try_recv().is_ok());

        let revoke = dispatcher
            .handle(
                local(),
                Request::Revoke {
                    admin_password: "root".to_string(),
                    public_key: KEY.parse().unwrap(),
                },
            )
            .await;
        assert!(matches!(revoke, Response::Released { .. }));

        let again = dispatcher
            .handle(
                local(),
                Request::Revoke {
                    admin_password: "root".to_string(),
                    public_key: KEY.parse().unwrap(),
                },
            )
            .await;
        assert!(matches!(
            again,
            Response::Error {
                code: ErrorCode::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let (dispatcher, _rx) = dispatcher(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let config = ServerConfig {
            max_line_bytes: 512,
            ..Default::default()
        };
        let server = tokio::spawn(serve(
            listener,
            Arc::new(dispatcher),
            config,
            shutdown.clone(),
        ));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Framed::new(stream, LinesCodec::new());

        client.send(r#"{"op":"ping"}"#.to_string()).await.unwrap();
        let pong: Response = serde_json::from_str(&client.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(
            pong,
            Response::Pong {
                version: VERSION.to_string()
            }
        );

        client.send("not json".to_string()).await.unwrap();
        let bad: Response = serde_json::from_str(&client.next().await.unwrap().unwrap()).unwrap();
        assert!(matches!(
            bad,
            Response::Error {
                code: ErrorCode::BadRequest,
                ..
            }
        ));

        client
            .send(serde_json::to_string(&register("pw")).unwrap())
            .await
            .unwrap();
        let allocated: Response =
            serde_json::from_str(&client.next().await.unwrap().unwrap()).unwrap();
        assert!(matches!(allocated, Response::Allocated { .. }));

        // Oversized lines are answered, then the connection is closed
        client.send("x".repeat(2048)).await.unwrap();
        let long: Response = serde_json::from_str(&client.next().await.unwrap().unwrap()).unwrap();
        assert!(matches!(
            long,
            Response::Error {
                code: ErrorCode::BadRequest,
                ..
            }
        ));
        assert!(!matches!(client.next().await, Some(Ok(_))));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
