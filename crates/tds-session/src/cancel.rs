//! Query cancellation.
//!
//! A [`CancelHandle`] can be moved to another task and used while the
//! session is blocked reading results. Cancelling before any request bytes
//! are sent aborts the write locally; after that, exactly one ATTENTION
//! packet goes out per cancelled request and the session drains the
//! server's acknowledgment before it is reused.

use std::sync::Arc;

use crate::error::SessionError;
use crate::shared::SessionShared;
use crate::state::SessionId;

/// Handle for cancelling the current operation on a session.
#[derive(Clone)]
pub struct CancelHandle {
    pub(crate) shared: Arc<SessionShared>,
}

impl CancelHandle {
    /// Request cancellation of the in-flight operation.
    ///
    /// Calling this more than once per operation is harmless.
    pub async fn cancel(&self) -> Result<(), SessionError> {
        if self.shared.is_broken() {
            return Ok(());
        }
        if self.shared.request_cancel() {
            if let Err(e) = self.shared.send_attention().await {
                tracing::warn!(
                    session_id = self.shared.id.0,
                    error = %e,
                    "failed to send attention"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Whether cancellation was requested for the current operation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.lock().cancelled
    }

    /// Whether an ATTENTION is awaiting its acknowledgment.
    #[must_use]
    pub fn attention_pending(&self) -> bool {
        self.shared.attention_pending()
    }

    /// Session this handle belongs to.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.shared.id
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("session_id", &self.shared.id)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
