use tokio::sync::mpsc;

/// The far side is gone; nothing more can be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("peer link closed")]
pub struct LinkClosed;

/// Ordered, reliable text-frame channel to one remote peer.
#[allow(async_fn_in_trait)]
pub trait PeerLink {
    async fn send(&mut self, frame: String) -> Result<(), LinkClosed>;

    /// Next frame, or `None` once the link has closed.
    async fn recv(&mut self) -> Option<String>;

    /// Stop sending and receiving. The far side sees `None` from `recv`.
    fn close(&mut self);
}

/// In-process link over unbounded tokio channels.
#[derive(Debug)]
pub struct MemoryLink {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl MemoryLink {
    /// Two connected ends.
    pub fn pair() -> (MemoryLink, MemoryLink) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MemoryLink {
                tx: Some(a_tx),
                rx: a_rx,
            },
            MemoryLink {
                tx: Some(b_tx),
                rx: b_rx,
            },
        )
    }

    /// Push a raw frame, bypassing any encoding. Used to feed malformed input.
    pub fn send_raw(&self, frame: &str) -> Result<(), LinkClosed> {
        self.tx
            .as_ref()
            .ok_or(LinkClosed)?
            .send(frame.to_string())
            .map_err(|_| LinkClosed)
    }
}

impl PeerLink for MemoryLink {
    async fn send(&mut self, frame: String) -> Result<(), LinkClosed> {
        self.tx
            .as_ref()
            .ok_or(LinkClosed)?
            .send(frame)
            .map_err(|_| LinkClosed)
    }

    async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}
