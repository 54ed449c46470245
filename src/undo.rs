//! Reverse-order compensation for multi-step resource acquisition

use crate::{Error, Result};

type UndoAction = Box<dyn FnOnce() -> Result<()> + Send>;

/// Collects compensating actions while a sequence of side effects succeeds.
///
/// `undo_all` runs them most-recent-first. Every action runs at most once,
/// and a failing action does not stop the ones after it.
#[derive(Default)]
pub struct UndoStack {
    actions: Vec<(String, UndoAction)>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, description: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.actions.push((description.into(), Box::new(action)));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Drop every action without running it; the acquired resources are kept
    pub fn commit(mut self) {
        self.actions.clear();
    }

    pub fn undo_all(mut self) -> Vec<Error> {
        let mut errors = Vec::new();
        while let Some((description, action)) = self.actions.pop() {
            tracing::debug!(step = %description, "undoing");
            if let Err(e) = action() {
                tracing::warn!(step = %description, error = %e, "undo step failed");
                errors.push(e);
            }
        }
        errors
    }

    /// Roll back and fold the undo failures into the error returned to the caller
    pub fn rollback(self, cause: Error) -> Error {
        let cleanup = self.undo_all();
        if cleanup.is_empty() {
            cause
        } else {
            Error::CreationRollback {
                source: Box::new(cause),
                cleanup,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn undo_runs_in_reverse_order() {
        let log = recorder();
        let mut undo = UndoStack::new();
        for name in ["user", "directory", "job"] {
            let log = log.clone();
            undo.push(name, move || {
                log.lock().push(name);
                Ok(())
            });
        }

        assert!(undo.undo_all().is_empty());
        assert_eq!(*log.lock(), vec!["job", "directory", "user"]);
    }

    #[test]
    fn failing_step_does_not_stop_the_rest() {
        let log = recorder();
        let mut undo = UndoStack::new();
        let first = log.clone();
        undo.push("user", move || {
            first.lock().push("user");
            Ok(())
        });
        undo.push("job", || Err(Error::HostUnavailable));

        let errors = undo.undo_all();
        assert_eq!(errors.len(), 1);
        assert_eq!(*log.lock(), vec!["user"]);
    }

    #[test]
    fn clean_rollback_returns_original_error() {
        let mut undo = UndoStack::new();
        undo.push("noop", || Ok(()));
        let err = undo.rollback(Error::HostStartup("no handshake".into()));
        assert!(matches!(err, Error::HostStartup(_)));
    }

    #[test]
    fn dirty_rollback_aggregates() {
        let mut undo = UndoStack::new();
        undo.push("user", || Err(Error::InvalidArgument("user".into())));
        let err = undo.rollback(Error::HostStartup("no handshake".into()));
        match err {
            Error::CreationRollback { source, cleanup } => {
                assert!(matches!(*source, Error::HostStartup(_)));
                assert_eq!(cleanup.len(), 1);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn commit_discards_actions() {
        let log = recorder();
        let mut undo = UndoStack::new();
        let l = log.clone();
        undo.push("user", move || {
            l.lock().push("user");
            Ok(())
        });
        assert_eq!(undo.len(), 1);
        undo.commit();
        assert!(log.lock().is_empty());
    }
}
