//! Private channels between mesh members.
//!
//! A `MeshPort` is one end of a bidirectional private channel: two crossed
//! unbounded mpsc channels, created in pairs. Each end is owned exclusively
//! by the unit holding it; handing an end to another unit moves the value
//! inside a message payload. The same primitive, split into its halves,
//! serves as a unit's inbox.

use tokio::sync::mpsc;

use crate::types::Frame;

/// The sending half of a channel into a unit. Cloned freely.
#[derive(Debug, Clone)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<Frame>,
}

/// The receiving half, held by exactly one event loop.
#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
}

/// One end of a private bidirectional channel.
#[derive(Debug)]
pub struct MeshPort {
    pub sender: PortSender,
    pub receiver: PortReceiver,
}

impl MeshPort {
    /// Create a connected pair; frames sent on one end arrive on the other,
    /// in send order.
    pub fn pair() -> (MeshPort, MeshPort) {
        let (a_tx, a_rx) = channel();
        let (b_tx, b_rx) = channel();
        (
            MeshPort {
                sender: b_tx,
                receiver: a_rx,
            },
            MeshPort {
                sender: a_tx,
                receiver: b_rx,
            },
        )
    }

    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

/// A one-directional channel; used for unit inboxes.
pub fn channel() -> (PortSender, PortReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PortSender { tx }, PortReceiver { rx })
}

impl PortSender {
    /// Post a frame. Returns false if the receiving end is gone — the
    /// destination is unreachable and the caller decides what that means.
    pub fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PortReceiver {
    /// Receive the next frame; `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Drain whatever is currently queued without waiting.
    pub fn try_drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }
}
