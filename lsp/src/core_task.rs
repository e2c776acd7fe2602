//! Core event processing.
//!
//! One thread (`lsp-core`) consumes [`CoreEvent`]s posted by link drivers
//! and by the send path. When no event arrives within the poll interval it
//! services every interface queue, so frames queued while the event queue was
//! full still leave eventually.

use crate::stack::Stack;
use lsp_core::error::LspError;
use lsp_core::interface::InterfaceId;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Work items for the core thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreEvent {
    /// Frames are waiting in the interface's receive queue.
    NetRx(InterfaceId),
    /// Frames are waiting in the interface's transmit queue.
    NetTx(InterfaceId),
    /// Stop the core thread.
    Shutdown,
}

pub(crate) fn run(stack: Arc<Stack>) {
    let poll = Some(stack.config().core_poll_interval);
    debug!("[CORE] started, poll interval {:?}", poll);

    while stack.running.load(Ordering::Acquire) {
        match stack.core_events.pop(poll) {
            Ok(CoreEvent::NetRx(iface)) => stack.process_rx(iface),
            Ok(CoreEvent::NetTx(iface)) => stack.process_tx(iface),
            Ok(CoreEvent::Shutdown) => break,
            Err(LspError::Timeout | LspError::QueueEmpty) => {
                trace!("[CORE] idle tick");
                stack.service_all();
            }
            Err(LspError::Destroyed) => break,
            Err(e) => error!("[CORE] event queue error: {}", e),
        }
    }

    debug!("[CORE] stopped");
}
