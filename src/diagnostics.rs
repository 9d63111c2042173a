//! Diagnostic sink handed to pipeline components.
//!
//! Components never rely on the process-wide subscriber. Each one is
//! constructed with a [`Diagnostics`] handle and emits its `tracing` events
//! inside [`Diagnostics::in_scope`], so tests can capture or silence the
//! output of a single component without touching global state.

use tracing::Dispatch;

/// A cloneable handle to the `tracing` dispatcher a component reports to.
#[derive(Clone)]
pub struct Diagnostics {
    dispatch: Dispatch,
}

impl Diagnostics {
    /// Report to the dispatcher that is current on the calling thread.
    pub fn current() -> Self {
        Self {
            dispatch: tracing::dispatcher::get_default(|dispatch| dispatch.clone()),
        }
    }

    /// Report to an explicit dispatcher.
    pub fn from_dispatch(dispatch: Dispatch) -> Self {
        Self { dispatch }
    }

    /// Discard all events.
    pub fn silent() -> Self {
        Self {
            dispatch: Dispatch::none(),
        }
    }

    /// Run `f` with this sink as the default dispatcher.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::current()
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics").finish_non_exhaustive()
    }
}
