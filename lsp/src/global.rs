//! Optional process-wide stack instance.
//!
//! Applications that want a single implicit stack call [`init`] once at
//! startup and reach it through [`instance`] afterwards. Everything else in
//! this crate works on an explicit [`Stack`] and never touches this module.

use crate::stack::Stack;
use lsp_core::config::LspConfig;
use lsp_core::error::Result;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

static INSTANCE: Lazy<Mutex<Option<Arc<Stack>>>> = Lazy::new(|| Mutex::new(None));

/// Create and start the process-wide stack.
///
/// # Panics
///
/// Panics if a stack is already installed. Initializing twice is a
/// programming error, not a runtime condition.
pub fn init(conf: LspConfig) -> Result<Arc<Stack>> {
    let stack = Arc::new(Stack::new(conf)?);
    init_with(Arc::clone(&stack))?;
    Ok(stack)
}

/// Start `stack` and install it as the process-wide instance.
///
/// # Panics
///
/// Panics if a stack is already installed.
pub fn init_with(stack: Arc<Stack>) -> Result<()> {
    let mut slot = INSTANCE.lock();
    assert!(slot.is_none(), "lsp stack initialized twice");
    stack.start()?;
    debug!("[CORE] global stack {:04X} installed", stack.address());
    *slot = Some(stack);
    Ok(())
}

/// The process-wide stack, if [`init`] has run.
pub fn instance() -> Option<Arc<Stack>> {
    INSTANCE.lock().clone()
}

/// Stop and uninstall the process-wide stack.
///
/// Does nothing when no stack is installed.
pub fn shutdown() -> Result<()> {
    let Some(stack) = INSTANCE.lock().take() else {
        return Ok(());
    };
    stack.shutdown()
}
