//! Relay context: the connection handles shared by both feeds.
//!
//! Built once in `main`, passed to the coordinator, and released by
//! [`RelayContext::shutdown`] whichever task ended first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::channels::{ChannelReader, ChannelSender};
use crate::store::Database;

#[derive(Clone)]
pub struct RelayContext {
    pub store: Arc<dyn Database>,
    pub reader: Arc<dyn ChannelReader>,
    pub sender: Arc<dyn ChannelSender>,
    closed: Arc<AtomicBool>,
}

impl RelayContext {
    pub fn new(
        store: Arc<dyn Database>,
        reader: Arc<dyn ChannelReader>,
        sender: Arc<dyn ChannelSender>,
    ) -> Self {
        Self {
            store,
            reader,
            sender,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Close the reader, the sender and the store.
    ///
    /// Every handle is closed even if an earlier one fails. Calling this
    /// more than once is a no-op.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.reader.shutdown().await {
            warn!(error = %e, "Reader shutdown failed");
        }
        if let Err(e) = self.sender.shutdown().await {
            warn!(error = %e, "Sender shutdown failed");
        }
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Store close failed");
        }
        info!("Connections released");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
