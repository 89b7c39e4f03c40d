use crate::transport::TransportEvent;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

#[async_trait]
pub trait AwaitTransportEventExt {
    async fn recv_with_timeout<F>(
        &mut self,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<TransportEvent>
    where
        F: Fn(&TransportEvent) -> bool + Send;
}

#[async_trait]
impl AwaitTransportEventExt for broadcast::Receiver<TransportEvent> {
    async fn recv_with_timeout<F>(
        &mut self,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<TransportEvent>
    where
        F: Fn(&TransportEvent) -> bool + Send,
    {
        loop {
            match tokio::time::timeout(timeout, self.recv()).await {
                Ok(Ok(event)) if predicate(&event) => return Ok(event),
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(anyhow::anyhow!("Timeout")),
                _ => continue,
            }
        }
    }
}
