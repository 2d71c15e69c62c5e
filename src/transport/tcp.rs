use super::messages::PartyMessage;
use super::pool::{Connector, PartyLink};
use crate::party::{Endpoint, Party};
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

/// Dials parties over TCP and announces the local party with a `hello` frame.
///
/// Transport security is provided by the deployment (tunnel or terminating
/// proxy) in front of these sockets.
pub struct TcpConnector {
    local: Party,
}

impl TcpConnector {
    pub fn new(local: Party) -> Self {
        Self { local }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<Box<dyn PartyLink>> {
        let stream = TcpStream::connect(endpoint.address()).await?;
        stream.set_nodelay(true)?;

        let mut link = TcpLink {
            writer: BufWriter::new(stream),
        };

        let hello = PartyMessage::Hello { party: self.local }
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        link.write_frame(&hello).await?;

        Ok(Box::new(link))
    }
}

struct TcpLink {
    writer: BufWriter<TcpStream>,
}

#[async_trait]
impl PartyLink for TcpLink {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await
    }
}
