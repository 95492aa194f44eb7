use crate::buffer::EventBatch;

#[cfg(test)]
use mockall::automock;

/// Downstream of the warehouser: receives cut batches for delivery.
#[cfg_attr(test, automock)]
pub trait BatchSink: Send + Sync + 'static {
    /// Hands over ownership of a batch. Must not block.
    fn forward(&self, batch: EventBatch);

    /// Asks the delivery side to bring its connection up, e.g. before a
    /// background flush.
    fn ensure_connected(&self);

    /// Restarts the connect cycle right away, skipping any backoff wait.
    fn force_reconnect(&self);
}
