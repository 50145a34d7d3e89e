//! Websocket server wiring: one TCP listener, routed by handshake path to
//! the client handler or the ingress collector.
//!
//! The HTTP login surface is an external collaborator; connections arrive
//! here already vetted, so the handshake callback is where that layer
//! plugs in. Unauthenticated deployments fall back to the default
//! namespace and the "nobody" nickname.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_util::sync::CancellationToken;

use crate::detmap::DetectorMap;
use crate::error::Result;
use crate::live::bus::Bus;
use crate::live::client::ClientHandler;
use crate::live::ingress;

#[derive(Clone, Debug)]
pub struct ServerProps {
    pub port: u16,
    pub namespace: String,
    pub max_npr: f64,
    pub auto_shutdown: bool,
}

pub async fn run(props: ServerProps) -> Result<()> {
    // An unloadable detector map is fatal; nothing downstream can work.
    let detmap = DetectorMap::load_embedded()?;

    let bus = Bus::new();
    let clients = Arc::new(AtomicU64::new(0));
    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    let listener = TcpListener::bind(("0.0.0.0", props.port)).await?;
    log::info!("server started on :{}", props.port);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                let bus = bus.clone();
                let detmap = detmap.clone();
                let clients = clients.clone();
                let props = props.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer, bus, detmap, clients, props, shutdown).await;
                });
            }
        }
    }

    log::info!("successful quit");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    bus: Bus,
    detmap: Arc<DetectorMap>,
    clients: Arc<AtomicU64>,
    props: ServerProps,
    shutdown: CancellationToken,
) {
    let mut path = String::new();
    let ws = match accept_hdr_async(stream, |request: &Request, response: Response| {
        path = request.uri().path().to_string();
        Ok(response)
    })
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("websocket handshake with {peer} failed: {e}");
            return;
        }
    };

    match path.as_str() {
        "/client" => {
            let handler = ClientHandler {
                bus,
                detmap,
                max_npr: props.max_npr,
                clients,
                shutdown: props.auto_shutdown.then_some(shutdown),
            };
            handler
                .serve(ws, "nobody".to_string(), vec![props.namespace])
                .await;
        }
        "/ingress" => {
            log::info!("serving websocket data collector to {peer}");
            ingress::collect(ws, bus, props.namespace, detmap).await;
        }
        other => {
            log::warn!("unknown websocket path {other:?} from {peer}");
        }
    }
}
