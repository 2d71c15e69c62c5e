//! TCP front end and interserver listener
//!
//! Both listeners speak newline-delimited JSON. Client connections send
//! `ClientRequest`s and receive `ClientEvent`s. Interserver connections
//! open with a `hello` naming their party, then stream party messages.

use crate::config::Config;
use crate::dispatcher::{session_sweeper_task, QueryDispatcher};
use crate::error::Result;
use crate::party::Role;
use crate::pipeline::{ConnectionContext, InboundEvent, Pipeline, StageFlow};
use crate::session::ClientHandle;
use crate::transport::messages::{ClientEvent, ClientRequest, PartyMessage};
use crate::transport::tcp::TcpConnector;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};

/// Events buffered toward one client before the reporter waits.
const CLIENT_EVENT_BUFFER: usize = 256;

/// Bind both listeners from `config` and serve until ctrl-c.
pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let connector = Arc::new(TcpConnector::new(config.local_party));
    let dispatcher = Arc::new(QueryDispatcher::with_connector(config.clone(), connector));

    let front = TcpListener::bind(&config.front_listen).await?;
    let interserver = TcpListener::bind(config.interserver_listen.address()).await?;

    log::info!("🔗 Client listener on {}", front.local_addr()?);
    log::info!("🔗 Interserver listener on {}", interserver.local_addr()?);

    serve(dispatcher, front, interserver).await
}

/// Accept loop over already-bound listeners.
pub async fn serve(
    dispatcher: Arc<QueryDispatcher>,
    front: TcpListener,
    interserver: TcpListener,
) -> Result<()> {
    let sweeper = tokio::spawn(session_sweeper_task(dispatcher.clone()));

    loop {
        tokio::select! {
            accepted = front.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::info!("👤 Client connected from {}", peer);
                    tokio::spawn(handle_front(stream, peer.to_string(), dispatcher.clone()));
                }
                Err(e) => log::error!("❌ Client accept failed: {}", e),
            },

            accepted = interserver.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_interserver(stream, peer.to_string(), dispatcher.clone()));
                }
                Err(e) => log::error!("❌ Interserver accept failed: {}", e),
            },

            _ = tokio::signal::ctrl_c() => {
                log::info!("🛑 Shutdown requested, {} queries in flight", dispatcher.sessions().len());
                break;
            }
        }
    }

    sweeper.abort();
    Ok(())
}

async fn handle_front(stream: TcpStream, peer: String, dispatcher: Arc<QueryDispatcher>) {
    let (read_half, write_half) = stream.into_split();
    let (client, mut events) = ClientHandle::channel(format!("front-{}", peer), CLIENT_EVENT_BUFFER);

    let writer_peer = peer.clone();
    let writer = tokio::spawn(async move {
        let mut writer = BufWriter::new(write_half);
        while let Some(event) = events.recv().await {
            let frame = match event.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("❌ Cannot encode event for {}: {}", writer_peer, e);
                    continue;
                }
            };
            if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
    });

    let ctx = ConnectionContext::front(peer.clone(), client.clone());
    let pipeline = Pipeline::for_role(Role::Front, dispatcher);
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!("⚠️  Read from client {} failed: {}", peer, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match ClientRequest::decode(&line) {
            Ok(request) => {
                if pipeline.on_event(&ctx, &InboundEvent::Client(request)).await == StageFlow::Stop {
                    break;
                }
            }
            Err(e) => {
                log::warn!("⚠️  Malformed request from {}: {}", peer, e);
                client.send(ClientEvent::error(None, &e)).await;
            }
        }
    }

    pipeline.on_close(&ctx).await;
    writer.abort();
}

async fn handle_interserver(stream: TcpStream, peer: String, dispatcher: Arc<QueryDispatcher>) {
    let mut lines = BufReader::new(stream).lines();

    let party = match lines.next_line().await {
        Ok(Some(line)) => match PartyMessage::decode(&line) {
            Ok(PartyMessage::Hello { party }) => party,
            Ok(_) | Err(_) => {
                log::warn!("⚠️  Interserver connection {} did not open with hello", peer);
                return;
            }
        },
        Ok(None) => return,
        Err(e) => {
            log::warn!("⚠️  Read from {} failed: {}", peer, e);
            return;
        }
    };
    log::info!("🔗 {} connected from {}", party, peer);

    let ctx = ConnectionContext::interserver(peer.clone(), party);
    let pipeline = Pipeline::for_role(party.role(), dispatcher);

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!("⚠️  Read from {} ({}) failed: {}", party, peer, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match PartyMessage::decode(&line) {
            Ok(message) => {
                if pipeline.on_event(&ctx, &InboundEvent::Party(message)).await == StageFlow::Stop {
                    break;
                }
            }
            Err(e) => log::warn!("⚠️  Malformed frame from {}: {}", party, e),
        }
    }

    pipeline.on_close(&ctx).await;
}
