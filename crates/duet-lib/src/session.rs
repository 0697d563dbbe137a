//! Session registry and turn cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use duet_core::types::TurnSummary;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Owner side of a turn's cancel flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side, handed to the running turn.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled. Pends forever if the token is
    /// dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Public view of a connected session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub conversation_id: String,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    pub turns: u32,
    pub busy: bool,
    pub last_turn: Option<TurnSummary>,
}

struct Entry {
    info: SessionInfo,
    cancel: Option<CancelToken>,
}

/// Connected sessions with the cancel handle of their running turn.
#[derive(Default)]
pub struct Sessions {
    inner: Mutex<HashMap<Uuid, Entry>>,
}

impl Sessions {
    pub fn open(&self, conversation_id: &str, user_id: &str) -> Uuid {
        let session_id = Uuid::new_v4();
        let info = SessionInfo {
            session_id,
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            connected_at: Utc::now(),
            turns: 0,
            busy: false,
            last_turn: None,
        };
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id, Entry { info, cancel: None });
        session_id
    }

    /// Mark a turn as running. Returns `None` while another turn is still
    /// running on the session (one turn at a time).
    pub fn begin_turn(&self, session_id: Uuid) -> Option<CancelSignal> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.get_mut(&session_id)?;
        if entry.info.busy {
            return None;
        }
        let token = CancelToken::new();
        let signal = token.signal();
        entry.cancel = Some(token);
        entry.info.busy = true;
        entry.info.turns += 1;
        Some(signal)
    }

    pub fn finish_turn(&self, session_id: Uuid, summary: TurnSummary) {
        if let Some(entry) = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&session_id)
        {
            entry.cancel = None;
            entry.info.busy = false;
            entry.info.last_turn = Some(summary);
        }
    }

    /// Cancel the running turn, if any. Returns whether one was running.
    pub fn cancel(&self, session_id: Uuid) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get(&session_id).and_then(|e| e.cancel.as_ref()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel any running turn and forget the session.
    pub fn close(&self, session_id: Uuid) {
        if let Some(entry) = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session_id)
        {
            if let Some(token) = entry.cancel {
                token.cancel();
            }
        }
    }

    pub fn get(&self, session_id: Uuid) -> Option<SessionInfo> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&session_id)
            .map(|e| e.info.clone())
    }

    /// Snapshot, oldest connection first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|e| e.info.clone())
            .collect();
        sessions.sort_by_key(|s| s.connected_at);
        sessions
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::types::Turn;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_signal() {
        let token = CancelToken::new();
        let mut signal = token.signal();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
            true
        });
        token.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap());
        assert!(token.signal().is_cancelled());
    }

    #[tokio::test]
    async fn never_signal_pends() {
        let mut signal = CancelSignal::never();
        let res = tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(res.is_err());
    }

    #[test]
    fn one_turn_at_a_time() {
        let sessions = Sessions::default();
        let id = sessions.open("c1", "u1");
        let signal = sessions.begin_turn(id).unwrap();
        assert!(sessions.begin_turn(id).is_none());

        assert!(sessions.cancel(id));
        assert!(signal.is_cancelled());

        sessions.finish_turn(id, Turn::new("c1").summary());
        let info = sessions.get(id).unwrap();
        assert!(!info.busy);
        assert_eq!(info.turns, 1);
        assert!(info.last_turn.is_some());
        assert!(sessions.begin_turn(id).is_some());
    }

    #[test]
    fn close_cancels_and_forgets() {
        let sessions = Sessions::default();
        let id = sessions.open("c1", "u1");
        let signal = sessions.begin_turn(id).unwrap();
        sessions.close(id);
        assert!(signal.is_cancelled());
        assert!(sessions.is_empty());
        assert!(!sessions.cancel(id));
        assert!(sessions.begin_turn(id).is_none());
    }
}
