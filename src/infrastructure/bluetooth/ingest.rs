//! Inbound path shared by notifications and poll reads:
//! raw bytes -> diagnostics -> codec -> state store.

use crate::domain::error::ParseError;
use crate::domain::models::Direction;
use crate::domain::store::StateStore;
use crate::infrastructure::bluetooth::connection::NotificationHandler;
use crate::infrastructure::bluetooth::protocol::PortCodec;
use crate::infrastructure::diagnostics::Diagnostics;
use std::sync::Arc;
use tracing::{trace, warn};

pub struct FrameIngest {
    codec: Arc<dyn PortCodec>,
    store: Arc<StateStore>,
    diagnostics: Arc<Diagnostics>,
}

impl FrameIngest {
    pub fn new(
        codec: Arc<dyn PortCodec>,
        store: Arc<StateStore>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            codec,
            store,
            diagnostics,
        }
    }

    /// Decode one received frame and apply it.
    ///
    /// Malformed frames are logged and dropped without touching the store.
    pub fn handle(&self, bytes: &[u8]) -> Result<(), ParseError> {
        self.diagnostics.record(Direction::Inbound, bytes);

        match self.codec.decode(bytes) {
            Ok(delta) => {
                trace!("Decoded {:?}", delta);
                self.store.apply_delta(&delta);
                Ok(())
            }
            Err(e) => {
                warn!("Dropping {}-byte frame: {}", bytes.len(), e);
                Err(e)
            }
        }
    }

    /// Wrap this pipeline as a transport notification callback.
    pub fn handler(self: &Arc<Self>) -> NotificationHandler {
        let ingest = Arc::clone(self);
        Arc::new(move |bytes: &[u8]| {
            let _ = ingest.handle(bytes);
        })
    }
}
