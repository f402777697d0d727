use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    tungstenite::{self, Message as WsMessage},
    WebSocketStream,
};
use tracing::trace;

use crate::{entity::Message, error::RelayError, hub::FrameSink, Result};

type WsStream = WebSocketStream<TcpStream>;

/// Split an upgraded websocket into the half the hub writes to and the half
/// the connection handler reads from.
pub fn split(stream: WsStream, peer: SocketAddr) -> (ConnectionWriter, ConnectionReader) {
    let (sink, stream) = stream.split();
    (
        ConnectionWriter { peer, sink },
        ConnectionReader { peer, stream },
    )
}

/// Outbound half. Owned by the hub once registered.
#[derive(Debug)]
pub struct ConnectionWriter {
    peer: SocketAddr,
    sink: SplitSink<WsStream, WsMessage>,
}

/// Inbound half. Owned by the connection's receive loop.
#[derive(Debug)]
pub struct ConnectionReader {
    peer: SocketAddr,
    stream: SplitStream<WsStream>,
}

impl ConnectionReader {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Read the next `Message` from the peer.
    ///
    /// Text and binary frames each carry one JSON message. Control frames are
    /// skipped. Returns `None` once the peer closes the socket; a frame that
    /// does not decode yields `RelayError::MalformedMessage` and leaves the
    /// stream usable.
    pub async fn read_frame(&mut self) -> Result<Option<Message>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(txt))) => return Ok(Some(serde_json::from_str(&txt)?)),
                Some(Ok(WsMessage::Binary(buf))) => return Ok(Some(serde_json::from_slice(&buf)?)),
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(transport_error(err)),
            }
        }
    }
}

#[async_trait]
impl FrameSink for ConnectionWriter {
    async fn send(&mut self, msg: &Message) -> Result<()> {
        let frame = serde_json::to_string(msg)?;
        trace!(peer = %self.peer, "write frame: {}", &frame);
        self.sink
            .send(WsMessage::Text(frame))
            .await
            .map_err(transport_error)
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await.map_err(transport_error)
    }
}

/// A socket the peer already shut is reported as `ConnectionClosed`.
fn transport_error(err: tungstenite::Error) -> RelayError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            RelayError::ConnectionClosed
        }
        err => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_sockets_map_to_connection_closed() {
        assert!(matches!(
            transport_error(tungstenite::Error::AlreadyClosed),
            RelayError::ConnectionClosed
        ));
        assert!(matches!(
            transport_error(tungstenite::Error::ConnectionClosed),
            RelayError::ConnectionClosed
        ));
        assert!(matches!(
            transport_error(tungstenite::Error::Utf8),
            RelayError::WsError(_)
        ));
    }
}
