//! In-process connector: frames land on a channel instead of a socket
//!
//! Used to embed a node without networking and to drive dispatch in tests.
//! Each party can be made to refuse connections, stall writes, or fail
//! writes.

use super::pool::{Connector, PartyLink};
use crate::party::{Endpoint, Party};
use async_trait::async_trait;
use dashmap::DashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub struct MemoryConnector {
    frames: mpsc::UnboundedSender<(Party, Vec<u8>)>,
    refused: DashSet<Party>,
    broken: Arc<DashSet<Party>>,
    stalled: [watch::Sender<bool>; 3],
    attempts: [AtomicUsize; 3],
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Party, Vec<u8>)>) {
        let (frames, rx) = mpsc::unbounded_channel();
        let connector = Self {
            frames,
            refused: DashSet::new(),
            broken: Arc::new(DashSet::new()),
            stalled: [
                watch::channel(false).0,
                watch::channel(false).0,
                watch::channel(false).0,
            ],
            attempts: [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)],
        };
        (connector, rx)
    }

    pub fn refuse(&self, party: Party) {
        self.refused.insert(party);
    }

    pub fn accept(&self, party: Party) {
        self.refused.remove(&party);
    }

    /// Hold every write to `party` until `resume`.
    pub fn stall(&self, party: Party) {
        self.stalled[party.index()].send_replace(true);
    }

    pub fn resume(&self, party: Party) {
        self.stalled[party.index()].send_replace(false);
    }

    /// Make writes on existing links to `party` fail.
    pub fn break_links(&self, party: Party) {
        self.broken.insert(party);
    }

    pub fn attempts(&self, party: Party) -> usize {
        self.attempts[party.index()].load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<Box<dyn PartyLink>> {
        let party = endpoint.party;
        self.attempts[party.index()].fetch_add(1, Ordering::SeqCst);

        if self.refused.contains(&party) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} refused connection", endpoint.address()),
            ));
        }

        self.broken.remove(&party);
        Ok(Box::new(MemoryLink {
            party,
            frames: self.frames.clone(),
            broken: self.broken.clone(),
            stalled: self.stalled[party.index()].subscribe(),
        }))
    }
}

struct MemoryLink {
    party: Party,
    frames: mpsc::UnboundedSender<(Party, Vec<u8>)>,
    broken: Arc<DashSet<Party>>,
    stalled: watch::Receiver<bool>,
}

#[async_trait]
impl PartyLink for MemoryLink {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.stalled
            .wait_for(|stalled| !*stalled)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connector dropped"))?;

        if self.broken.contains(&self.party) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link broken"));
        }

        self.frames
            .send((self.party, frame.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "frame receiver dropped"))
    }
}
