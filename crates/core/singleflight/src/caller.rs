use std::{any::type_name, fmt, future::Future, hash::Hash, sync::Arc};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::watch::{channel as watch_channel, Receiver, Sender};

use crate::{CallerConfig, Context, Error};

/// One-shot gate of an in-flight call, `None` until the leader publishes
type Gate<V> = Receiver<Option<Arc<V>>>;

/// Coalesces concurrent calls sharing a key into a single execution.
///
/// The first caller for a key becomes the leader and runs the work, any
/// caller arriving while that work is in flight waits for and shares its
/// result. Nothing is retained once the leader finishes.
pub struct Caller<K, V> {
    config: Arc<CallerConfig>,
    calls: Arc<DashMap<K, Gate<V>>>,
}

enum Role<V> {
    Leader(Sender<Option<Arc<V>>>),
    Follower(Gate<V>),
}

impl<K, V> Caller<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: CallerConfig) -> Self {
        Self {
            config: Arc::new(config),
            calls: Arc::new(DashMap::new()),
        }
    }

    /// Run `func` for `key`, or share the result of the execution already in flight for it.
    ///
    /// `func` receives a context derived from `ctx` which carries `key`, see
    /// [`Caller::key_from_context`]. Only followers honour `ctx`; the leader
    /// always drives `func` to completion.
    pub async fn call<F, Fut>(&self, ctx: &Context, key: K, func: F) -> Result<Arc<V>, Error>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = V>,
    {
        let role = match self.calls.entry(key.clone()) {
            Entry::Occupied(entry) => Role::Follower(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (sender, receiver) = watch_channel(None);
                entry.insert(receiver);
                Role::Leader(sender)
            }
        };

        match role {
            Role::Follower(gate) => self.follow(ctx, gate).await,
            Role::Leader(sender) => {
                debug!("[{}] Starting a new execution.", self.config.name);

                let flight = Flight {
                    name: &self.config.name,
                    calls: &self.calls,
                    key,
                    sender: Some(sender),
                };

                let value = Arc::new(func(ctx.with_key(flight.key.clone())).await);
                flight.publish(value.clone());

                Ok(value)
            }
        }
    }

    async fn follow(&self, ctx: &Context, mut gate: Gate<V>) -> Result<Arc<V>, Error> {
        debug!("[{}] Joining an in-flight execution.", self.config.name);

        let bounded;
        let ctx = match self.config.follower_timeout {
            Some(timeout) => {
                bounded = ctx.with_timeout(timeout);
                &bounded
            }
            None => ctx,
        };

        tokio::select! {
            biased;
            reason = ctx.done() => {
                debug!("[{}] Follower gave up: {reason}", self.config.name);
                Err(reason.into())
            }
            published = gate.wait_for(Option::is_some) => published
                .ok()
                .and_then(|value| (*value).clone())
                .ok_or(Error::Abandoned),
        }
    }

    /// Key the executor invoked by [`Caller::call`] is running under.
    ///
    /// # Panics
    ///
    /// Panics if `ctx` was not derived from an executor's context, which
    /// is always an integration bug.
    pub fn key_from_context(&self, ctx: &Context) -> K {
        match ctx.key::<K>() {
            Some(key) => key.clone(),
            None => panic!("context carries no {} key", type_name::<K>()),
        }
    }

    /// Number of keys with an execution in flight
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    /// Whether an execution is in flight for `key`
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.calls.contains_key(key)
    }
}

impl<K, V> Default for Caller<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::from_config(CallerConfig::default())
    }
}

impl<K, V> Clone for Caller<K, V> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            calls: self.calls.clone(),
        }
    }
}

impl<K, V> fmt::Debug for Caller<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Caller")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Leader's hold on an in-flight record.
///
/// Dropping it without publishing (the leader's future was dropped or `func`
/// panicked) deregisters the key and closes the gate, releasing every
/// follower with [`Error::Abandoned`].
struct Flight<'a, K: Hash + Eq, V> {
    name: &'a str,
    calls: &'a DashMap<K, Gate<V>>,
    key: K,
    sender: Option<Sender<Option<Arc<V>>>>,
}

impl<K: Hash + Eq, V> Flight<'_, K, V> {
    /// Open the gate, then deregister the key, both under the registry lock.
    fn publish(mut self, value: Arc<V>) {
        if let Some(sender) = self.sender.take() {
            self.calls.remove_if(&self.key, |_, _| {
                sender.send_replace(Some(value));
                true
            });

            debug!("[{}] Published result.", self.name);
        }
    }
}

impl<K: Hash + Eq, V> Drop for Flight<'_, K, V> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            warn!("[{}] Leader abandoned its execution, releasing followers.", self.name);

            self.calls.remove(&self.key);
            drop(sender);
        }
    }
}
