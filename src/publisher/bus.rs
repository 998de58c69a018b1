use zeromq::{PubSocket, Socket, SocketSend, ZmqMessage};

use crate::error::PublishError;

/// Abstraction over the message bus a Publisher hands finished records to.
/// Kept as a trait so tests can substitute an in-memory double instead of
/// binding a real socket.
#[async_trait::async_trait]
pub trait BusPublisher: Send {
    async fn publish(&mut self, topic: &str, metadata_json: &[u8], payload: &[u8]) -> Result<(), PublishError>;
    async fn close(&mut self) -> Result<(), PublishError>;
}

/// Publishes `[topic, metadata_json, payload]` multipart messages over a
/// bound `zeromq::PubSocket`, matching the original's
/// `socket.send_multipart([...], copy=False)` shape.
pub struct ZmqBusPublisher {
    socket: PubSocket,
}

impl ZmqBusPublisher {
    pub async fn bind(address: &str) -> Result<Self, PublishError> {
        let mut socket = PubSocket::new();
        socket
            .bind(address)
            .await
            .map_err(|e| PublishError::Bind(address.to_string(), e.to_string()))?;
        Ok(Self { socket })
    }
}

/// Builds the `BusPublisher` a `Supervisor` hands to each `Publisher` it
/// starts. Kept as a trait (rather than hardcoding `ZmqBusPublisher::bind`
/// in the Supervisor) so integration tests can supply an in-memory double
/// without binding a real socket.
#[async_trait::async_trait]
pub trait BusFactory: Send + Sync {
    async fn build(&self, address: &str) -> Result<Box<dyn BusPublisher>, PublishError>;
}

/// The production `BusFactory`: binds a fresh `ZmqBusPublisher` per pipeline
/// start.
pub struct ZmqBusFactory;

#[async_trait::async_trait]
impl BusFactory for ZmqBusFactory {
    async fn build(&self, address: &str) -> Result<Box<dyn BusPublisher>, PublishError> {
        Ok(Box::new(ZmqBusPublisher::bind(address).await?))
    }
}

#[async_trait::async_trait]
impl BusPublisher for ZmqBusPublisher {
    async fn publish(&mut self, topic: &str, metadata_json: &[u8], payload: &[u8]) -> Result<(), PublishError> {
        let mut message = ZmqMessage::from(topic.as_bytes().to_vec());
        message.push_back(metadata_json.to_vec().into());
        message.push_back(payload.to_vec().into());

        self.socket
            .send(message)
            .await
            .map_err(|e| PublishError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), PublishError> {
        Ok(())
    }
}
