//! Generation token: the single cancellation primitive of a session.
//!
//! The generation counter is advanced by exactly one writer (the interruption
//! controller). Every frame produced on behalf of a response carries the
//! generation it was started under; consumers drop frames whose tag is older
//! than [`GenerationToken::current`]. The session-wide cancellation flag is
//! separate and only ever moves from "running" to "cancelled".

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Inner {
    generation: watch::Sender<u64>,
    session: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct GenerationToken {
    inner: Arc<Inner>,
}

impl Default for GenerationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationToken {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                generation,
                session: CancellationToken::new(),
            }),
        }
    }

    pub fn current(&self) -> u64 {
        *self.inner.generation.borrow()
    }

    /// Invalidate all work tagged with the current generation. Returns the new one.
    pub fn advance(&self) -> u64 {
        let mut next = 0;
        self.inner.generation.send_modify(|g| {
            *g += 1;
            next = *g;
        });
        next
    }

    pub fn is_stale(&self, generation: u64) -> bool {
        generation < self.current()
    }

    /// Receiver woken on every advance.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.generation.subscribe()
    }

    /// Cancel the whole session. Idempotent.
    pub fn cancel_session(&self) {
        self.inner.session.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.session.is_cancelled()
    }

    /// Resolves once the session has been cancelled.
    pub async fn cancelled(&self) {
        self.inner.session.cancelled().await
    }

    /// Child token for services started within this session.
    pub fn child_token(&self) -> CancellationToken {
        self.inner.session.child_token()
    }
}
