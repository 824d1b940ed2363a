//! Units of work placed in a [`Sequence`](crate::Sequence).

use std::sync::Arc;

use crate::monitor::RequestMonitor;

/// One step of a sequence.
///
/// Both actions run on the sequence's dispatch executor and receive a monitor
/// they must complete eventually, possibly after returning (for example once
/// an external process replies). The context is shared by every step of the
/// sequence.
pub trait Step<C>: Send + Sync {
    /// Name used in logs and reports.
    fn name(&self) -> &str;

    /// Performs the step.
    fn execute(&self, context: &Arc<C>, rm: RequestMonitor);

    /// Undoes a successful [`execute`](Self::execute) after a later step failed.
    ///
    /// Steps with nothing to undo keep the default, which completes at once.
    fn rollback(&self, _context: &Arc<C>, rm: RequestMonitor) {
        if let Err(err) = rm.done() {
            tracing::error!(step = self.name(), %err, "default rollback could not complete");
        }
    }
}

type Action<C> = Box<dyn Fn(&Arc<C>, RequestMonitor) + Send + Sync + 'static>;

/// A step assembled from closures, for sequences built at runtime.
pub struct FnStep<C> {
    name: String,
    execute: Action<C>,
    rollback: Option<Action<C>>,
}

impl<C> FnStep<C> {
    /// Creates a step with a forward action and no rollback.
    pub fn new<F>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(&Arc<C>, RequestMonitor) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            execute: Box::new(execute),
            rollback: None,
        }
    }

    /// Adds a rollback action.
    pub fn with_rollback<F>(mut self, rollback: F) -> Self
    where
        F: Fn(&Arc<C>, RequestMonitor) + Send + Sync + 'static,
    {
        self.rollback = Some(Box::new(rollback));
        self
    }
}

impl<C: Send + Sync> Step<C> for FnStep<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, context: &Arc<C>, rm: RequestMonitor) {
        (self.execute)(context, rm)
    }

    fn rollback(&self, context: &Arc<C>, rm: RequestMonitor) {
        match &self.rollback {
            Some(rollback) => rollback(context, rm),
            None => {
                if let Err(err) = rm.done() {
                    tracing::error!(step = %self.name, %err, "rollback could not complete");
                }
            }
        }
    }
}

impl<C> std::fmt::Debug for FnStep<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStep")
            .field("name", &self.name)
            .field("has_rollback", &self.rollback.is_some())
            .finish()
    }
}
