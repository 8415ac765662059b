use tokio::sync::broadcast;

use crate::error::{EchoError, Result};
use crate::types::PushEvent;

/// Receiver for push-gateway events.
///
/// Receivers are independent: each gets every event from the moment it was
/// created, in wire order. They stay valid across reconnects of the
/// underlying channel.
pub struct EventReceiver {
    rx: broadcast::Receiver<PushEvent>,
}

impl EventReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<PushEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event.
    ///
    /// Returns [`EchoError::ConnectionClosed`] once the channel has been
    /// stopped and all buffered events were drained.
    pub async fn recv(&mut self) -> Result<PushEvent> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EchoError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(n) => {
                EchoError::ChannelError(format!("Lagged by {} messages", n))
            }
        })
    }

    /// Try to receive an event without blocking
    ///
    /// Returns `None` if no event is queued.
    pub fn try_recv(&mut self) -> Result<Option<PushEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(EchoError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(EchoError::ChannelError(format!("Lagged by {} messages", n)))
            }
        }
    }
}
