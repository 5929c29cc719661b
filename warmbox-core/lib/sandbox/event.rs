use std::{
    fmt,
    sync::{Arc, RwLock},
};

use crate::sandbox::SandboxId;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Something that happened to a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxEvent {
    /// The sandbox the event is about.
    pub id: SandboxId,

    /// What happened.
    pub kind: SandboxEventKind,
}

/// The kinds of [`SandboxEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxEventKind {
    /// The sandbox was created and wrapped.
    Create,

    /// The sandbox was destroyed.
    Destroy,

    /// The sandbox was paused.
    Pause,

    /// The sandbox was unpaused.
    Unpause,

    /// The sandbox forked a child.
    Fork {
        /// The new child.
        child: SandboxId,
    },
}

/// A callback invoked for every event of every sandbox in a pool.
pub type SandboxEventFn = Arc<dyn Fn(&SandboxEvent) + Send + Sync>;

/// The listeners registered with a pool, shared with every sandbox it creates.
///
/// Listeners registered later also see events of sandboxes created earlier.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<RwLock<Vec<SandboxEventFn>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxEvent {
    /// Creates an event.
    pub fn new(id: SandboxId, kind: SandboxEventKind) -> Self {
        Self { id, kind }
    }
}

impl Listeners {
    /// Registers a listener.
    pub fn add(&self, listener: SandboxEventFn) {
        match self.inner.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    /// The number of registered listeners.
    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(listeners) => listeners.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every listener with `event`, in registration order.
    pub fn notify(&self, event: SandboxEvent) {
        tracing::trace!("sandbox {} event: {:?}", event.id, event.kind);

        // Listeners may register further listeners, so call them outside the lock.
        let listeners: Vec<SandboxEventFn> = match self.inner.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        for listener in listeners {
            listener(&event);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_listeners_called_in_order() {
        let listeners = Listeners::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            listeners.add(Arc::new(move |event: &SandboxEvent| {
                seen.lock().unwrap().push((tag, event.kind));
            }));
        }

        listeners.notify(SandboxEvent::new(SandboxId::new(1), SandboxEventKind::Pause));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("first", SandboxEventKind::Pause),
                ("second", SandboxEventKind::Pause)
            ]
        );
    }

    #[test]
    fn test_clones_share_registrations() {
        let listeners = Listeners::default();
        let handed_out = listeners.clone();
        listeners.add(Arc::new(|_: &SandboxEvent| {}));
        assert_eq!(handed_out.len(), 1);
    }
}
