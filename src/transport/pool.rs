//! Shared outbound channels, one per party
//!
//! Channels are dialed on first use and reused by every session. Concurrent
//! `acquire` calls for the same party wait on a single dial.

use super::backpressure::{BackpressureController, OutboundPermit};
use super::messages::PartyMessage;
use crate::error::{QueryError, Result};
use crate::party::{Endpoint, Party, PartyRegistry};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};

/// Write half of an established connection to one party.
#[async_trait]
pub trait PartyLink: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;
}

/// Dials a party's endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> std::io::Result<Box<dyn PartyLink>>;
}

/// Cloneable sender onto one party's channel.
///
/// Frames are queued together with their byte permit and written in order
/// by a dedicated writer task.
#[derive(Clone)]
pub struct ChannelHandle {
    party: Party,
    queue: mpsc::UnboundedSender<(Vec<u8>, OutboundPermit)>,
    closed: Arc<AtomicBool>,
    backpressure: Arc<BackpressureController>,
}

impl ChannelHandle {
    fn spawn(party: Party, mut link: Box<dyn PartyLink>, backpressure: Arc<BackpressureController>) -> Self {
        let (queue, mut frames) = mpsc::unbounded_channel::<(Vec<u8>, OutboundPermit)>();
        let closed = Arc::new(AtomicBool::new(false));

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            while let Some((frame, permit)) = frames.recv().await {
                let written = link.write_frame(&frame).await;
                drop(permit);

                if let Err(e) = written {
                    log::warn!("❌ Write to {} failed: {}", party, e);
                    writer_closed.store(true, Ordering::SeqCst);
                    break;
                }
            }
            log::debug!("Writer for {} stopped", party);
        });

        Self {
            party,
            queue,
            closed,
            backpressure,
        }
    }

    pub fn party(&self) -> Party {
        self.party
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.queue.is_closed()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Queue a message, waiting for room in the party's byte budget first.
    pub async fn send(&self, message: &PartyMessage) -> Result<()> {
        if self.is_closed() {
            return Err(QueryError::ChannelClosed(self.party));
        }

        let frame = message.encode()?;
        let permit = self
            .backpressure
            .reserve(self.party, frame.len())
            .await
            .ok_or(QueryError::ChannelClosed(self.party))?;

        self.queue.send((frame, permit)).map_err(|_| {
            self.close();
            QueryError::ChannelClosed(self.party)
        })
    }

    /// Handles are not query-scoped; dropping one leaves the channel open.
    pub fn release(self) {}
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("party", &self.party)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub struct ChannelPool {
    registry: Arc<PartyRegistry>,
    connector: Arc<dyn Connector>,
    backpressure: Arc<BackpressureController>,
    cells: DashMap<Party, Arc<OnceCell<ChannelHandle>>>,
}

impl ChannelPool {
    pub fn new(
        registry: Arc<PartyRegistry>,
        connector: Arc<dyn Connector>,
        backpressure: Arc<BackpressureController>,
    ) -> Self {
        Self {
            registry,
            connector,
            backpressure,
            cells: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<PartyRegistry> {
        &self.registry
    }

    pub fn backpressure(&self) -> &Arc<BackpressureController> {
        &self.backpressure
    }

    /// Shared channel to `party`, dialing it if there is none yet.
    pub async fn acquire(&self, party: Party) -> Result<ChannelHandle> {
        let endpoint = self
            .registry
            .endpoint(party)
            .ok_or_else(|| QueryError::ConnectFailed {
                party,
                reason: "no endpoint configured".to_string(),
            })?;

        // A closed handle is dropped from the pool and dialed once more.
        for _ in 0..2 {
            let cell = self
                .cells
                .entry(party)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let handle = cell
                .get_or_try_init(|| async {
                    log::info!("🔗 Dialing {} at {}", party, endpoint.address());
                    let link = self.connector.connect(endpoint).await.map_err(|e| {
                        QueryError::ConnectFailed {
                            party,
                            reason: e.to_string(),
                        }
                    })?;
                    log::info!("✅ Connected to {}", party);
                    Ok::<_, QueryError>(ChannelHandle::spawn(party, link, self.backpressure.clone()))
                })
                .await?
                .clone();

            if !handle.is_closed() {
                return Ok(handle);
            }
            self.cells.remove_if(&party, |_, current| Arc::ptr_eq(current, &cell));
        }

        Err(QueryError::ChannelClosed(party))
    }

    /// Forget the channel to `party`; the next `acquire` redials.
    pub fn invalidate(&self, party: Party) {
        if let Some((_, cell)) = self.cells.remove(&party) {
            if let Some(handle) = cell.get() {
                handle.close();
                log::warn!("⚠️  Channel to {} invalidated", party);
            }
        }
    }

    pub fn is_connected(&self, party: Party) -> bool {
        self.cells
            .get(&party)
            .and_then(|cell| cell.get().map(|handle| !handle.is_closed()))
            .unwrap_or(false)
    }

    pub fn connected(&self) -> Vec<Party> {
        Party::all()
            .into_iter()
            .filter(|&party| self.is_connected(party))
            .collect()
    }
}
