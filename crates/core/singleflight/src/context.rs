use std::{any::Any, fmt, sync::Arc, time::Duration};

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Reason a [`Context`] is done
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum ContextError {
    /// The context (or one of its ancestors) was canceled
    Canceled,
    /// The context's deadline has passed
    DeadlineExceeded,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::Canceled => write!(f, "Context canceled"),
            ContextError::DeadlineExceeded => write!(f, "Context deadline exceeded"),
        }
    }
}

impl std::error::Error for ContextError {}

/// Cancelable, deadline-bearing execution context
///
/// Contexts form a tree: every derived context observes the cancellation and
/// deadline of its parent, while canceling a derived context never affects
/// the parent. Cloning a context yields a handle to the same context.
#[derive(Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
    keys: Option<Arc<KeyEntry>>,
}

/// Key attached by a leader, linked to the keys attached further up the tree
struct KeyEntry {
    key: Box<dyn Any + Send + Sync>,
    parent: Option<Arc<KeyEntry>>,
}

impl Context {
    /// Root context, never done unless canceled explicitly
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            keys: None,
        }
    }

    /// Derive a context which can be canceled independently of this one
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            keys: self.keys.clone(),
        }
    }

    /// Derive a context which ends at `deadline` at the latest
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            deadline: Some(match self.deadline {
                Some(current) => current.min(deadline),
                None => deadline,
            }),
            ..self.with_cancel()
        }
    }

    /// Derive a context which ends `timeout` from now at the latest
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context carrying `key`, shadowing only a key of the same type
    pub(crate) fn with_key<K: Send + Sync + 'static>(&self, key: K) -> Self {
        Self {
            keys: Some(Arc::new(KeyEntry {
                key: Box::new(key),
                parent: self.keys.clone(),
            })),
            ..self.with_cancel()
        }
    }

    /// Cancel this context and every context derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Effective deadline of this context
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether this context is done and why
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            Some(ContextError::Canceled)
        } else if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            Some(ContextError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Wait until this context is done
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                () = self.token.cancelled() => ContextError::Canceled,
                () = sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }

    /// Nearest key of type `K` carried by this context
    pub fn key<K: 'static>(&self) -> Option<&K> {
        let mut entry = self.keys.as_deref();
        while let Some(current) = entry {
            if let Some(key) = current.key.downcast_ref::<K>() {
                return Some(key);
            }

            entry = current.parent.as_deref();
        }

        None
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("canceled", &self.token.is_cancelled())
            .field("deadline", &self.deadline)
            .field("has_key", &self.keys.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{sleep, Instant};

    use super::{Context, ContextError};

    #[test]
    fn cancel_flows_down_only() {
        let parent = Context::background();
        let child = parent.with_cancel();
        let grandchild = child.with_cancel();

        child.cancel();

        assert_eq!(parent.err(), None);
        assert_eq!(child.err(), Some(ContextError::Canceled));
        assert_eq!(grandchild.err(), Some(ContextError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_inherited_and_tightened() {
        let parent = Context::background().with_timeout(Duration::from_millis(100));
        let looser = parent.with_timeout(Duration::from_secs(10));
        let tighter = parent.with_timeout(Duration::from_millis(50));

        assert_eq!(looser.deadline(), parent.deadline());
        assert!(tighter.deadline() < parent.deadline());

        let start = Instant::now();
        assert_eq!(looser.done().await, ContextError::DeadlineExceeded);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(parent.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn done_reports_cancellation() {
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        let handle = ctx.clone();

        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });

        assert_eq!(ctx.done().await, ContextError::Canceled);
    }

    #[test]
    fn keys_are_typed_and_inherited() {
        let ctx = Context::background().with_key("user:1".to_string());
        let child = ctx.with_cancel();

        assert_eq!(child.key::<String>().map(String::as_str), Some("user:1"));
        assert_eq!(child.key::<u64>(), None);
        assert_eq!(Context::background().key::<String>(), None);
    }

    #[test]
    fn nested_keys_of_other_types_survive() {
        let outer = Context::background().with_key("user:1".to_string());
        let inner = outer.with_cancel().with_key(7_u64);
        let shadowed = inner.with_key("user:2".to_string());

        assert_eq!(inner.key::<String>().map(String::as_str), Some("user:1"));
        assert_eq!(inner.key::<u64>(), Some(&7));
        assert_eq!(shadowed.key::<String>().map(String::as_str), Some("user:2"));
        assert_eq!(shadowed.key::<u64>(), Some(&7));
        assert_eq!(outer.key::<u64>(), None);
    }
}
