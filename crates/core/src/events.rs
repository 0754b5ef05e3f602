use tokio::sync::{mpsc, oneshot};

/// Notifications produced by a connection and the models built on it.
#[derive(Debug)]
pub enum ConnectionEvent {
    ConnectionSuccess,
    ConnectionFailed(String),
    /// Must be answered before the tunnel proceeds.
    ConfirmUnknownHost(HostKeyPrompt),
    DatabaseChanged(String),
    QueryExecuted {
        statement: String,
        status: String,
    },
    PagesChanged {
        offset: u64,
        page_size: u64,
        total: u64,
    },
}

/// An unknown SSH host key awaiting an accept/reject decision. Dropping the
/// prompt unanswered rejects the key.
#[derive(Debug)]
pub struct HostKeyPrompt {
    host: String,
    fingerprint: String,
    reply: oneshot::Sender<bool>,
}

impl HostKeyPrompt {
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn answer(self, accept: bool) {
        let _ = self.reply.send(accept);
    }

    pub fn accept(self) {
        self.answer(true);
    }

    pub fn reject(self) {
        self.answer(false);
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl EventSender {
    pub fn emit(&self, event: ConnectionEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event stream closed; dropping connection event");
        }
    }
}

#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }

    /// Non-blocking poll for UI loops.
    pub fn try_next(&mut self) -> Option<ConnectionEvent> {
        self.rx.try_recv().ok()
    }
}

#[must_use]
pub fn event_channel() -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventStream { rx })
}

/// Round-trips unknown host keys to whoever owns the event stream.
#[derive(Debug, Clone)]
pub struct HostKeyConfirmer {
    events: EventSender,
}

impl HostKeyConfirmer {
    #[must_use]
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }

    pub async fn confirm(&self, host: &str, fingerprint: &str) -> bool {
        let (reply, answer) = oneshot::channel();
        self.events
            .emit(ConnectionEvent::ConfirmUnknownHost(HostKeyPrompt {
                host: host.to_string(),
                fingerprint: fingerprint.to_string(),
                reply,
            }));
        answer.await.unwrap_or(false)
    }
}
