//! Fan-out of one process's output to its registered listeners.
//!
//! Output accumulates in a current `OutputBundle`. A cut closes the current
//! bundle and queues it on every registration, which then applies its own
//! `OutputPolicy`: stream it, hold it until a batch is full, or hold it and
//! drop the oldest units on overflow. Due pushes are queued on an outbox in
//! the order they were planned and sent outside the registry lock by
//! whichever caller holds the send lock, so every listener sees units in
//! order and registry changes never wait on a slow consumer.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, TryLockError};

use tracing::{debug, info, warn};
use url::Url;

use node_agent_common::wire::Heartbeat;
use node_agent_common::{
    now_millis, Channel, DeliveryMode, NodeError, OutputBundle, OutputListener, OutputPolicy,
    RemoteListenableConfig,
};

use crate::url_output::UrlOutputListener;

#[derive(Clone)]
enum Sink {
    Local(Arc<dyn OutputListener>),
    Url(Arc<UrlOutputListener>),
}

impl Sink {
    fn listener(&self) -> Arc<dyn OutputListener> {
        match self {
            Sink::Local(l) => l.clone(),
            Sink::Url(u) => u.clone(),
        }
    }

    fn close(&self) {
        if let Sink::Url(u) = self {
            u.close();
        }
    }
}

struct Registration {
    sink: Sink,
    policy: OutputPolicy,
    pending: VecDeque<OutputBundle>,
}

impl Registration {
    fn new(sink: Sink, policy: OutputPolicy) -> Self {
        Self {
            sink,
            policy,
            pending: VecDeque::new(),
        }
    }
}

struct Registry {
    policy: OutputPolicy,
    closed: bool,
    listeners: BTreeMap<String, Registration>,
}

struct Push {
    id: String,
    listener: Arc<dyn OutputListener>,
    streaming: bool,
    bundles: Vec<OutputBundle>,
}

/// Drop the oldest units once `pending` holds more than `cap`, at least a
/// `fraction` of the cap at a time.
fn discard_oldest(pending: &mut VecDeque<OutputBundle>, cap: usize, fraction: f64) -> usize {
    if pending.len() <= cap {
        return 0;
    }
    let chunk = (cap as f64 * fraction).ceil() as usize;
    let count = chunk.max(pending.len() - cap).min(pending.len());
    pending.drain(..count);
    count
}

pub struct RemoteListenable {
    name: String,
    discard_fraction: f64,
    current: Mutex<Option<OutputBundle>>,
    registry: Mutex<Registry>,
    outbox: Mutex<VecDeque<Push>>,
    send_lock: Mutex<()>,
}

impl RemoteListenable {
    /// Register the initial listeners named by `config`: `listener` under the
    /// configured id, and a push adapter for the configured URL.
    pub fn new(
        name: &str,
        config: &RemoteListenableConfig,
        listener: Option<Arc<dyn OutputListener>>,
        discard_fraction: f64,
    ) -> Result<Self, NodeError> {
        let mut listeners = BTreeMap::new();
        if let Some(listener) = listener {
            listeners.insert(
                config.listener_id().to_string(),
                Registration::new(Sink::Local(listener), config.policy()),
            );
        }
        if let Some(url) = config.url() {
            let adapter = UrlOutputListener::new(url.clone())?;
            if listeners.contains_key(url.as_str()) {
                return Err(NodeError::DuplicateListener(url.to_string()));
            }
            listeners.insert(
                url.to_string(),
                Registration::new(Sink::Url(Arc::new(adapter)), config.policy()),
            );
        }

        let mut first = OutputBundle::new(name);
        first.set_created(true);
        Ok(Self {
            name: name.to_string(),
            discard_fraction,
            current: Mutex::new(Some(first)),
            registry: Mutex::new(Registry {
                policy: config.policy(),
                closed: false,
                listeners,
            }),
            outbox: Mutex::new(VecDeque::new()),
            send_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered listener ids; empty once the process is destroyed.
    pub fn list(&self) -> Vec<String> {
        match self.registry.lock() {
            Ok(registry) if !registry.closed => registry.listeners.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.registry.lock().map(|r| r.closed).unwrap_or(true)
    }

    fn register(&self, id: String, sink: Sink) -> Result<(), NodeError> {
        let mut registry = self.registry.lock()?;
        if registry.closed {
            return Err(NodeError::ProcessDestroyed);
        }
        if registry.listeners.contains_key(&id) {
            return Err(NodeError::DuplicateListener(id));
        }
        debug!(process = %self.name, listener = %id, "Adding listener");
        let policy = registry.policy;
        registry.listeners.insert(id, Registration::new(sink, policy));
        Ok(())
    }

    pub fn add_listener(&self, id: &str, listener: Arc<dyn OutputListener>) -> Result<(), NodeError> {
        self.register(id.to_string(), Sink::Local(listener))
    }

    /// Anything still queued for the listener is dropped.
    pub fn remove_listener(&self, id: &str) -> Result<(), NodeError> {
        let removed = {
            let mut registry = self.registry.lock()?;
            if registry.closed {
                return Err(NodeError::ProcessDestroyed);
            }
            registry
                .listeners
                .remove(id)
                .ok_or_else(|| NodeError::UnknownListener(id.to_string()))?
        };
        debug!(process = %self.name, listener = %id, "Removed listener");
        removed.sink.close();
        Ok(())
    }

    pub fn add_url_listener(&self, url: &Url) -> Result<(), NodeError> {
        let adapter = UrlOutputListener::new(url.clone())?;
        self.register(url.to_string(), Sink::Url(Arc::new(adapter)))
    }

    pub fn remove_url_listener(&self, url: &Url) -> Result<(), NodeError> {
        self.remove_listener(url.as_str())
    }

    /// Policy applied to listeners added from now on.
    pub fn output_policy(&self) -> OutputPolicy {
        self.registry
            .lock()
            .map(|r| r.policy)
            .unwrap_or_default()
    }

    /// Queue whatever is pending under the old policy for delivery, then
    /// switch every listener to `policy`. Does not wait for a push already in
    /// flight.
    pub fn set_output_policy(&self, policy: OutputPolicy) -> Result<(), NodeError> {
        {
            let mut registry = self.registry.lock()?;
            if registry.closed {
                return Err(NodeError::ProcessDestroyed);
            }
            let pushes = self.plan(&mut registry, None, true, None);
            self.outbox.lock()?.extend(pushes);
            registry.policy = policy;
            for reg in registry.listeners.values_mut() {
                reg.policy = policy;
            }
        }
        self.dispatch(false)
    }

    /// Like `set_output_policy` for a single listener.
    pub fn set_listener_output_policy(&self, id: &str, policy: OutputPolicy) -> Result<(), NodeError> {
        {
            let mut registry = self.registry.lock()?;
            if registry.closed {
                return Err(NodeError::ProcessDestroyed);
            }
            if !registry.listeners.contains_key(id) {
                return Err(NodeError::UnknownListener(id.to_string()));
            }
            let pushes = self.plan(&mut registry, None, true, Some(id));
            self.outbox.lock()?.extend(pushes);
            if let Some(reg) = registry.listeners.get_mut(id) {
                reg.policy = policy;
            }
        }
        self.dispatch(false)
    }

    /// Cut the current bundle and push everything queued, regardless of policy.
    pub fn flush_output(&self) -> Result<(), NodeError> {
        if self.is_closed() {
            return Err(NodeError::ProcessDestroyed);
        }
        self.cycle(true)
    }

    /// Periodic cut; units go out only if their listener's policy says so.
    pub fn tick(&self) -> Result<(), NodeError> {
        self.cycle(false)
    }

    pub fn append_output(&self, channel: Channel, bytes: &[u8]) -> Result<(), NodeError> {
        {
            let mut current = self.current.lock()?;
            match current.as_mut() {
                Some(bundle) => {
                    bundle.append_output(channel, bytes);
                }
                None => return Err(NodeError::ProcessDestroyed),
            }
        }
        if self.has_streaming_listener()? {
            self.cycle(false)?;
        }
        Ok(())
    }

    /// Record a `"<percent>:<millis>"` load sample in the current bundle.
    pub fn append_idle_update(&self, percent: f64, millis: u64) -> Result<(), NodeError> {
        let mut current = self.current.lock()?;
        match current.as_mut() {
            Some(bundle) => {
                bundle.push_idle_update(format!("{}:{}", percent, millis));
                Ok(())
            }
            None => Err(NodeError::ProcessDestroyed),
        }
    }

    /// Heartbeats skip the bundle and every policy.
    pub fn send_heartbeat(&self) -> Result<(), NodeError> {
        let targets: Vec<(String, Arc<dyn OutputListener>)> = {
            let registry = self.registry.lock()?;
            if registry.closed {
                return Err(NodeError::ProcessDestroyed);
            }
            registry
                .listeners
                .iter()
                .map(|(id, reg)| (id.clone(), reg.sink.listener()))
                .collect()
        };
        let heartbeat = Heartbeat {
            name: self.name.clone(),
            timestamp: now_millis(),
        };
        let mut first_failure = None;
        for (id, listener) in targets {
            if let Err(e) = listener.handle_heartbeat(&heartbeat) {
                warn!(process = %self.name, listener = %id, error = %e, "Heartbeat failed");
                first_failure.get_or_insert(NodeError::ConsumerUnreachable {
                    id,
                    reason: e.to_string(),
                });
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Final delivery: queued units plus a last bundle marked destroyed go
    /// to every listener, URL streams are ended, and the registry empties.
    /// Later mutations fail with `ProcessDestroyed`.
    pub fn close(&self) -> Result<(), NodeError> {
        let listeners = {
            let mut current = self.current.lock()?;
            let mut registry = self.registry.lock()?;
            if registry.closed {
                return Ok(());
            }
            registry.closed = true;
            let last = current.take().map(|mut bundle| {
                bundle.set_destroyed();
                bundle
            });
            let pushes = self.plan(&mut registry, last, true, None);
            self.outbox.lock()?.extend(pushes);
            std::mem::take(&mut registry.listeners)
        };
        // nothing is queued after the registry closes, so this drains the
        // final units before the sinks end their streams
        let _ = self.dispatch(true);
        for reg in listeners.values() {
            reg.sink.close();
        }
        info!(process = %self.name, "Output closed");
        Ok(())
    }

    fn has_streaming_listener(&self) -> Result<bool, NodeError> {
        Ok(self
            .registry
            .lock()?
            .listeners
            .values()
            .any(|reg| reg.policy.mode() == DeliveryMode::Streaming))
    }

    /// Cut the current bundle and queue what is due. The cut and the plan
    /// happen under the same locks so units reach the outbox in cut order.
    fn cycle(&self, force: bool) -> Result<(), NodeError> {
        {
            let mut current = self.current.lock()?;
            let unit = if current.as_ref().is_some_and(|bundle| !bundle.is_empty()) {
                current.replace(OutputBundle::new(&self.name))
            } else {
                None
            };
            if unit.is_none() && !force {
                return Ok(());
            }
            let mut registry = self.registry.lock()?;
            if registry.closed {
                return Err(NodeError::ProcessDestroyed);
            }
            let pushes = self.plan(&mut registry, unit, force, None);
            self.outbox.lock()?.extend(pushes);
        }
        self.dispatch(true)
    }

    /// Queue `unit` on every registration and collect what is due.
    fn plan(
        &self,
        registry: &mut Registry,
        unit: Option<OutputBundle>,
        force: bool,
        only: Option<&str>,
    ) -> Vec<Push> {
        let mut pushes = Vec::new();
        for (id, reg) in registry.listeners.iter_mut() {
            if let Some(unit) = &unit {
                reg.pending.push_back(unit.clone());
            }
            if only.is_some_and(|only| only != id) {
                continue;
            }
            let mode = reg.policy.mode();
            let due = force
                || match mode {
                    DeliveryMode::Streaming => true,
                    DeliveryMode::Batch(n) => reg.pending.len() >= n,
                    DeliveryMode::BatchDiscard(cap) => {
                        let dropped = discard_oldest(&mut reg.pending, cap, self.discard_fraction);
                        if dropped > 0 {
                            debug!(process = %self.name, listener = %id, dropped, "Discarded output");
                        }
                        false
                    }
                };
            if due && !reg.pending.is_empty() {
                pushes.push(Push {
                    id: id.clone(),
                    listener: reg.sink.listener(),
                    streaming: mode == DeliveryMode::Streaming,
                    bundles: reg.pending.drain(..).collect(),
                });
            }
        }
        pushes
    }

    /// Send everything on the outbox. With `wait`, block for the send lock;
    /// otherwise leave the outbox to the current holder, which drains it
    /// again after each round.
    fn dispatch(&self, wait: bool) -> Result<(), NodeError> {
        let mut wait = wait;
        let mut first_failure = None;
        loop {
            let guard = if wait {
                self.send_lock.lock()?
            } else {
                match self.send_lock.try_lock() {
                    Ok(guard) => guard,
                    Err(TryLockError::WouldBlock) => break,
                    Err(TryLockError::Poisoned(_)) => return Err(NodeError::LockError),
                }
            };
            loop {
                let pushes: Vec<Push> = self.outbox.lock()?.drain(..).collect();
                if pushes.is_empty() {
                    break;
                }
                if let Err(e) = self.deliver(pushes) {
                    first_failure.get_or_insert(e);
                }
            }
            drop(guard);
            // units queued while the lock was held are sent on the next round
            if self.outbox.lock()?.is_empty() {
                break;
            }
            wait = false;
        }
        first_failure.map_or(Ok(()), Err)
    }

    fn deliver(&self, pushes: Vec<Push>) -> Result<(), NodeError> {
        let closing = self.is_closed();
        let mut first_failure = None;
        for push in pushes {
            let result = if push.streaming {
                push.bundles
                    .iter()
                    .try_for_each(|b| push.listener.handle_output_bundle(b))
            } else {
                push.listener.handle_output_bundles(&push.bundles)
            };
            if let Err(e) = result {
                if closing {
                    debug!(process = %self.name, listener = %push.id, error = %e, "Final delivery failed");
                    continue;
                }
                warn!(process = %self.name, listener = %push.id, error = %e, "Unable to deliver output");
                first_failure.get_or_insert(NodeError::ConsumerUnreachable {
                    id: push.id,
                    reason: e.to_string(),
                });
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Units still queued for `id` and not yet pushed.
    #[cfg(test)]
    fn pending_count(&self, id: &str) -> usize {
        self.registry
            .lock()
            .unwrap()
            .listeners
            .get(id)
            .map_or(0, |r| r.pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Vec<OutputBundle>>>,
        heartbeats: Mutex<usize>,
        fail: bool,
    }

    impl Recorder {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<Vec<OutputBundle>> {
            self.calls.lock().unwrap().clone()
        }

        fn bundles(&self) -> Vec<OutputBundle> {
            self.calls().into_iter().flatten().collect()
        }

        fn stdout(&self) -> String {
            let mut out = Vec::new();
            for bundle in self.bundles() {
                bundle.buffer().write_channel_to(&mut out, Channel::Out).unwrap();
            }
            String::from_utf8(out).unwrap()
        }
    }

    impl OutputListener for Recorder {
        fn handle_output_bundle(&self, bundle: &OutputBundle) -> anyhow::Result<()> {
            self.handle_output_bundles(std::slice::from_ref(bundle))
        }

        fn handle_output_bundles(&self, bundles: &[OutputBundle]) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("consumer gone");
            }
            self.calls.lock().unwrap().push(bundles.to_vec());
            Ok(())
        }

        fn handle_heartbeat(&self, _: &Heartbeat) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("consumer gone");
            }
            *self.heartbeats.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn listenable(policy: i32, recorder: &Arc<Recorder>) -> RemoteListenable {
        let config = RemoteListenableConfig::new(OutputPolicy::new(policy)).with_listener_id("rec");
        RemoteListenable::new("node", &config, Some(recorder.clone()), 0.25).unwrap()
    }

    #[test]
    fn test_streaming_pushes_each_unit() {
        let rec = Arc::new(Recorder::default());
        let l = listenable(0, &rec);
        l.append_output(Channel::Out, b"a").unwrap();
        l.append_output(Channel::Out, b"b").unwrap();
        let calls = rec.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0][0].created());
        assert!(!calls[1][0].created());
        assert_eq!(rec.stdout(), "ab");
    }

    #[test]
    fn test_batch_waits_for_full_batch() {
        let rec = Arc::new(Recorder::default());
        let l = listenable(5, &rec);
        for chunk in ["1", "2", "3", "4"] {
            l.append_output(Channel::Out, chunk.as_bytes()).unwrap();
            l.tick().unwrap();
        }
        assert!(rec.calls().is_empty());
        assert_eq!(l.pending_count("rec"), 4);
        l.append_output(Channel::Out, b"5").unwrap();
        l.tick().unwrap();
        let calls = rec.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 5);
        assert_eq!(l.pending_count("rec"), 0);
        assert_eq!(rec.stdout(), "12345");
    }

    #[test]
    fn test_empty_cut_is_skipped() {
        let rec = Arc::new(Recorder::default());
        let l = listenable(2, &rec);
        l.tick().unwrap(); // the created bundle
        l.tick().unwrap();
        l.tick().unwrap();
        assert_eq!(l.pending_count("rec"), 1);
    }

    #[test]
    fn test_batch_discard_drops_oldest() {
        let rec = Arc::new(Recorder::default());
        let l = listenable(-4, &rec);
        for i in 0..5 {
            l.append_output(Channel::Out, format!("{}", i).as_bytes()).unwrap();
            l.tick().unwrap();
        }
        assert!(rec.calls().is_empty());
        assert!(l.pending_count("rec") <= 4);

        l.flush_output().unwrap();
        let out = rec.stdout();
        assert!(!out.starts_with('0'));
        assert!(out.ends_with('4'));
        assert_eq!(l.pending_count("rec"), 0);
    }

    #[test]
    fn test_discard_chunk() {
        let mut pending: VecDeque<_> = (0..9).map(|ts| OutputBundle::with_timestamp("n", ts)).collect();
        assert_eq!(discard_oldest(&mut pending, 8, 0.25), 2);
        assert_eq!(pending.front().unwrap().timestamp(), 2);
        assert_eq!(discard_oldest(&mut pending, 8, 0.25), 0);
    }

    #[test]
    fn test_flush_ignores_policy() {
        let rec = Arc::new(Recorder::default());
        let l = listenable(100, &rec);
        l.append_output(Channel::Err, b"oops").unwrap();
        l.flush_output().unwrap();
        let bundles = rec.bundles();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].buffer().as_bytes(), b"oops");
    }

    #[test]
    fn test_policy_change_delivers_pending_first() {
        let rec = Arc::new(Recorder::default());
        let l = listenable(50, &rec);
        l.append_output(Channel::Out, b"queued").unwrap();
        l.tick().unwrap();
        assert!(rec.calls().is_empty());

        l.set_output_policy(OutputPolicy::new(0)).unwrap();
        assert_eq!(rec.stdout(), "queued");
        assert_eq!(l.output_policy(), OutputPolicy::new(0));

        l.append_output(Channel::Out, b"!").unwrap();
        assert_eq!(rec.stdout(), "queued!");
    }

    /// Holds its first push until released.
    struct Gate {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl OutputListener for Gate {
        fn handle_output_bundle(&self, _: &OutputBundle) -> anyhow::Result<()> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self
                .release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(10));
            Ok(())
        }
    }

    #[test]
    fn test_policy_change_does_not_wait_for_push_in_flight() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gate = Arc::new(Gate {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let config = RemoteListenableConfig::new(OutputPolicy::new(0)).with_listener_id("slow");
        let l = Arc::new(RemoteListenable::new("node", &config, Some(gate), 0.25).unwrap());

        let pusher = {
            let l = l.clone();
            thread::spawn(move || l.append_output(Channel::Out, b"slow"))
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let setter = {
            let l = l.clone();
            thread::spawn(move || {
                let result = l.set_output_policy(OutputPolicy::new(10));
                let _ = done_tx.send(());
                result
            })
        };
        assert!(done_rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert_eq!(l.output_policy(), OutputPolicy::new(10));

        release_tx.send(()).unwrap();
        pusher.join().unwrap().unwrap();
        setter.join().unwrap().unwrap();
    }

    #[test]
    fn test_duplicate_and_unknown_listener() {
        let rec = Arc::new(Recorder::default());
        let l = listenable(10, &rec);
        let err = l.add_listener("rec", rec.clone()).unwrap_err();
        assert_eq!(err, NodeError::DuplicateListener("rec".to_string()));
        assert_eq!(l.list(), vec!["rec"]);

        l.add_listener("other", rec.clone()).unwrap();
        assert_eq!(l.list(), vec!["other", "rec"]);
        l.remove_listener("other").unwrap();
        assert!(matches!(
            l.remove_listener("other"),
            Err(NodeError::UnknownListener(_))
        ));
    }

    #[test]
    fn test_failed_push_reports_unreachable() {
        let rec = Arc::new(Recorder::failing());
        let l = listenable(0, &rec);
        let err = l.append_output(Channel::Out, b"x").unwrap_err();
        assert!(matches!(err, NodeError::ConsumerUnreachable { .. }));
        assert!(matches!(
            l.send_heartbeat(),
            Err(NodeError::ConsumerUnreachable { .. })
        ));
    }

    #[test]
    fn test_heartbeat_bypasses_batching() {
        let rec = Arc::new(Recorder::default());
        let l = listenable(100, &rec);
        l.send_heartbeat().unwrap();
        assert_eq!(*rec.heartbeats.lock().unwrap(), 1);
        assert!(rec.calls().is_empty());
    }

    #[test]
    fn test_close_delivers_final_bundle_then_rejects() {
        let rec = Arc::new(Recorder::default());
        let l = listenable(100, &rec);
        l.append_output(Channel::Out, b"last").unwrap();
        l.append_idle_update(0.5, 42).unwrap();
        l.close().unwrap();

        let bundles = rec.bundles();
        let last = bundles.last().unwrap();
        assert!(last.destroyed());
        assert!(bundles[0].created());
        assert_eq!(bundles.iter().filter(|b| b.destroyed()).count(), 1);
        assert_eq!(rec.stdout(), "last");
        assert_eq!(last.idle_updates(), ["0.5:42".to_string()]);

        assert!(l.list().is_empty());
        assert_eq!(l.output_policy(), OutputPolicy::new(100));
        assert_eq!(
            l.add_listener("late", rec.clone()),
            Err(NodeError::ProcessDestroyed)
        );
        assert_eq!(l.append_output(Channel::Out, b"x"), Err(NodeError::ProcessDestroyed));
        assert_eq!(l.flush_output(), Err(NodeError::ProcessDestroyed));
        l.close().unwrap();
        assert_eq!(rec.bundles().len(), bundles.len());
    }
}
