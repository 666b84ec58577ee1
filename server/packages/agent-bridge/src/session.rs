use tokio::sync::watch;

/// Remembers the most recent provider session id reported by the agent.
#[derive(Debug)]
pub struct SessionCorrelator {
    sender: watch::Sender<Option<String>>,
}

/// Read side of a [`SessionCorrelator`], held by whoever consumes the stream.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    receiver: watch::Receiver<Option<String>>,
}

impl SessionCorrelator {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(None);
        Self { sender }
    }

    pub fn observe(&self, session_id: Option<&str>) {
        let Some(session_id) = session_id.map(str::trim).filter(|id| !id.is_empty()) else {
            return;
        };
        self.sender.send_if_modified(|current| {
            if current.as_deref() == Some(session_id) {
                return false;
            }
            tracing::debug!(session_id, "captured agent session id");
            *current = Some(session_id.to_string());
            true
        });
    }

    pub fn current(&self) -> Option<String> {
        self.sender.borrow().clone()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for SessionCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHandle {
    pub fn get(&self) -> Option<String> {
        self.receiver.borrow().clone()
    }
}
