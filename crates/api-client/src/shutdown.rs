use tokio::sync::watch;

/// Cancellation seen by one session's tasks.
///
/// Fires when the session's own flag is set or when the shared emergency
/// generation moves past the value it had when the session started. A dropped
/// sender also counts as a stop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    session: watch::Receiver<bool>,
    emergency: watch::Receiver<u64>,
    started_generation: u64,
}

impl Shutdown {
    pub fn new(session: watch::Receiver<bool>, emergency: watch::Receiver<u64>) -> Self {
        let started_generation = *emergency.borrow();
        Self { session, emergency, started_generation }
    }

    /// A fresh per-session flag bound to the shared emergency channel.
    pub fn channel(emergency: watch::Receiver<u64>) -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self::new(rx, emergency))
    }

    pub fn is_triggered(&self) -> bool {
        *self.session.borrow() || *self.emergency.borrow() != self.started_generation
    }

    pub fn is_emergency(&self) -> bool {
        *self.emergency.borrow() != self.started_generation
    }

    /// Resolves once a stop has been requested. Cancel-safe.
    pub async fn triggered(&mut self) {
        loop {
            if self.is_triggered() {
                return;
            }
            tokio::select! {
                changed = self.session.changed() => if changed.is_err() { return },
                changed = self.emergency.changed() => if changed.is_err() { return },
            }
        }
    }
}
