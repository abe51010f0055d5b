// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::HashMap,
    sync::{atomic::AtomicBool, Arc},
};

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, RwLock},
};
use uuid::Uuid;

use crate::{
    config::Config,
    connection::{Connection, Outcome},
    error::Result,
    keycontainer::KeyContainerStore,
    message,
    storage::{ConfigStore, SecretSeal},
    ui::UiHost,
};

type Registry = Arc<RwLock<HashMap<Uuid, mpsc::UnboundedSender<serde_json::Value>>>>;

/// A cheap, cloneable handle a caller can use to push a server-initiated
/// signal (e.g. "the database was opened") to one authorised connection
/// without holding the connection registry's lock for the duration of the
/// socket write: the lookup only borrows the registry long enough to clone
/// a channel sender, then releases it before the write happens on the
/// owning connection's own task.
#[derive(Clone)]
pub(crate) struct OutboundHandle {
    registry: Registry,
}

impl OutboundHandle {
    /// Enqueues `value` for encryption and delivery to connection `id`.
    /// Returns `false` if no such connection is currently open; the
    /// encryption itself happens on the connection's own task, since only
    /// it holds the session key.
    pub(crate) async fn signal(&self, id: Uuid, value: serde_json::Value) -> bool {
        let senders = self.registry.read().await;
        senders.get(&id).is_some_and(|tx| tx.send(value).is_ok())
    }
}

/// Accepts WebSocket connections on `config.bind` and runs one
/// [`Connection`] actor per socket until the listener is dropped or
/// `shutdown` resolves.
pub(crate) struct Server<C, S, U> {
    config: Arc<Config>,
    store: Arc<KeyContainerStore<C, S>>,
    ui: Arc<U>,
    registry: Registry,
}

impl<C, S, U> Server<C, S, U>
where
    C: ConfigStore + 'static,
    S: SecretSeal + 'static,
    U: UiHost + 'static,
{
    pub(crate) fn new(config: Arc<Config>, store: Arc<KeyContainerStore<C, S>>, ui: Arc<U>) -> Self {
        Self {
            config,
            store,
            ui,
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A handle for pushing outbound signals to connections this server is
    /// currently serving. Safe to clone and hand to RPC method handlers
    /// running outside this crate.
    pub(crate) fn outbound(&self) -> OutboundHandle {
        OutboundHandle {
            registry: Arc::clone(&self.registry),
        }
    }

    /// Binds the configured address and serves connections until `shutdown`
    /// completes. Each accepted socket is handed to its own task; a
    /// misbehaving client can only ever affect its own connection.
    pub(crate) async fn serve(self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind).await?;
        info!("listening for connections on {}", self.config.bind);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let config = Arc::clone(&self.config);
                    let store = Arc::clone(&self.store);
                    let ui = Arc::clone(&self.ui);
                    let registry = Arc::clone(&self.registry);
                    let _ = tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, config, store, ui, registry).await {
                            warn!("connection from {peer} ended with an error: {e}");
                        }
                    });
                }
                () = &mut shutdown => {
                    info!("shutdown signal received, no longer accepting new connections");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection<C, S, U>(
    stream: TcpStream,
    config: Arc<Config>,
    store: Arc<KeyContainerStore<C, S>>,
    ui: Arc<U>,
    registry: Registry,
) -> Result<()>
where
    C: ConfigStore,
    S: SecretSeal,
    U: UiHost,
{
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut stream) = message::WebSocketStream::from(ws).split();

    let id = Uuid::new_v4();
    let authorised = Arc::new(AtomicBool::new(false));
    let mut connection = Connection::new(id, config, store, ui, authorised);
    debug!("connection {id} opened");

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<serde_json::Value>();
    let _ = registry.write().await.insert(id, outbound_tx);

    loop {
        tokio::select! {
            envelope = stream.next() => {
                let Some(envelope) = envelope else { break };
                let envelope = match envelope {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        debug!("connection {id} sent an unparseable envelope: {e}");
                        continue;
                    }
                };

                match connection.handle(envelope).await {
                    Outcome::Reply(reply) => {
                        sink.send(reply).await?;
                    }
                    Outcome::Dispatch(_request) => {
                        // Dispatching a decrypted jsonrpc call to a method
                        // handler is outside what this crate implements; an
                        // embedder layers that in around `Connection::encrypt_reply`.
                        debug!("connection {id} authenticated a jsonrpc call with no dispatcher attached");
                    }
                    Outcome::None => {}
                }
            }
            signal = outbound_rx.recv() => {
                let Some(signal) = signal else { continue };
                if !connection.is_authorised() {
                    debug!("connection {id} dropped an outbound signal sent before authorisation");
                    continue;
                }
                match connection.encrypt_reply(&signal) {
                    Ok(envelope) => sink.send(envelope).await?,
                    Err(e) => warn!("connection {id} failed to encrypt an outbound signal: {e}"),
                }
            }
        }
    }

    let _ = registry.write().await.remove(&id);
    debug!("connection {id} closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpStream as ClientStream;

    use crate::{storage::Memory, ui::ConsoleUiHost};

    use super::*;

    fn test_config(bind: std::net::SocketAddr) -> Arc<Config> {
        Arc::new(Config {
            bind,
            security_level: crate::model::SecurityLevel::Medium,
            security_level_client_minimum: crate::model::SecurityLevel::Medium,
            auth_expiry_secs: 3600,
            persistence: crate::config::Persistence::Memory,
            config_dir: None,
            required_features: Vec::new(),
            features: vec!["KPRPC_FEATURE_VERSION_1_6".to_owned()],
        })
    }

    #[tokio::test]
    async fn accepts_connections_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bind = listener.local_addr().unwrap();
        drop(listener);

        let config = test_config(bind);
        let store = Arc::new(KeyContainerStore::<Memory, crate::storage::OsSeal>::new(
            Memory::new(),
            None,
        ));
        let ui = Arc::new(ConsoleUiHost::new());
        let server = Server::new(Arc::clone(&config), store, ui);
        let outbound = server.outbound();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let serving = tokio::spawn(async move {
            let _ = server
                .serve(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let connect_result = ClientStream::connect(bind).await;
        assert!(connect_result.is_ok());

        // No connection has finished its handshake, so this must be a no-op
        // rather than panicking or blocking.
        assert!(!outbound.signal(Uuid::new_v4(), serde_json::json!({})).await);

        let _ = shutdown_tx.send(());
        let _ = serving.await;
    }
}
