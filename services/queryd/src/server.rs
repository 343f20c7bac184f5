// Endpoint wiring: sockets, dispatchers and notification workers.
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use spire_chain::Chain;
use spire_notify::{NotificationWorker, NotifySink, SinkError, SubscriberIndex};
use spire_wire::{Envelope, Route};

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::dispatch::{self, Dispatcher, ServerContext};
use crate::transport::{RouterHandle, RouterSocket, TransportConfig};

// Notification sink over the router socket: wraps the payload in the wire
// envelope addressed to the subscription's route.
struct RouterSink {
    handle: RouterHandle,
}

#[async_trait]
impl NotifySink for RouterSink {
    async fn send(&self, route: &Route, command: &str, payload: Bytes) -> Result<(), SinkError> {
        let envelope = Envelope::notification(route, command, payload);
        self.handle
            .send(envelope.encode())
            .map_err(|_| SinkError::PeerGone)
    }
}

/// Running server: a public endpoint and optionally a secure one, each with
/// its own dispatcher pool, subscriber index and notification worker.
pub struct Server {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    public_addr: SocketAddr,
    secure_addr: Option<SocketAddr>,
    grace: std::time::Duration,
}

impl Server {
    /// Bind everything and start serving. Bind and keying failures abort
    /// startup; nothing background retries them.
    pub async fn start(config: ServerConfig, chain: Arc<dyn Chain>) -> Result<Self> {
        let (shutdown, _) = watch::channel(false);
        let transport = TransportConfig {
            max_frame_bytes: config.max_frame_bytes,
            ..TransportConfig::default()
        };

        let public_socket = RouterSocket::bind(config.public_bind, None, transport.clone())
            .await
            .context("bind public endpoint")?;
        let public_addr = public_socket.local_addr();
        tracing::info!(addr = %public_addr, "public query endpoint started");

        let mut server = Self {
            shutdown,
            tasks: Vec::new(),
            public_addr,
            secure_addr: None,
            grace: config.shutdown_grace(),
        };
        server.spawn_endpoint(public_socket, Arc::clone(&chain), &config);

        if let Some(secure_bind) = config.secure_bind {
            let authenticator = Arc::new(Authenticator::new(
                config.server_key.clone(),
                config.client_keys.clone(),
            ));
            if !authenticator.secure_ready() {
                bail!("secure endpoint requires SPIRE_SERVER_KEY");
            }
            let secure_socket =
                RouterSocket::bind(secure_bind, Some(authenticator), transport.clone())
                    .await
                    .context("bind secure endpoint")?;
            let secure_addr = secure_socket.local_addr();
            tracing::info!(addr = %secure_addr, "secure query endpoint started");
            server.secure_addr = Some(secure_addr);
            server.spawn_endpoint(secure_socket, chain, &config);
        }

        Ok(server)
    }

    fn spawn_endpoint(&mut self, socket: RouterSocket, chain: Arc<dyn Chain>, config: &ServerConfig) {
        let index = Arc::new(SubscriberIndex::new(config.subscription_limit));
        let ctx = Arc::new(ServerContext {
            chain: Arc::clone(&chain),
            index: Arc::clone(&index),
            subscription_ttl: config.subscription_ttl(),
        });
        let dispatcher = Arc::new(Dispatcher::new(ctx));
        let sink = Arc::new(RouterSink {
            handle: socket.handle(),
        });
        let worker =
            NotificationWorker::new(chain, index, sink, config.subscription_ttl());

        self.tasks
            .push(tokio::spawn(worker.run(self.shutdown.subscribe())));
        self.tasks.push(tokio::spawn(dispatch::serve(
            socket,
            dispatcher,
            config.worker_threads,
            config.query_timeout(),
            self.shutdown.subscribe(),
        )));
    }

    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    pub fn secure_addr(&self) -> Option<SocketAddr> {
        self.secure_addr
    }

    /// Stop accepting work, wait up to the grace period for in-flight
    /// handlers, then drop whatever remains.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for mut task in self.tasks {
            if tokio::time::timeout(self.grace, &mut task).await.is_err() {
                task.abort();
            }
        }
        tracing::info!("server stopped");
    }
}
