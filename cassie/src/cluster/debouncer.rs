//! Coalescing of metadata refresh requests.
//!
//! Server events tend to come in bursts: a node joining produces several
//! topology events, a migration produces a schema event per table. The
//! debouncer queues them and hands one merged [`RefreshBatch`] to its handler
//! once no new event arrived for `delay`, or `max_delay` after the first
//! queued event, whichever comes first.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::schema::FunctionSignature;
use crate::errors::MetadataError;

/// A request to bring part of the metadata up to date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshEvent {
    /// Re-read the node list.
    Topology,
    /// Re-read the whole schema.
    AllKeyspaces,
    /// Re-read one keyspace.
    Keyspace(String),
    /// The keyspace was dropped.
    KeyspaceDropped(String),
    /// Forget one element of a keyspace.
    Invalidate {
        keyspace: String,
        target: SchemaElement,
    },
}

/// An element of a keyspace that can be invalidated on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SchemaElement {
    Table(String),
    Type(String),
    Function(FunctionSignature),
    Aggregate(FunctionSignature),
}

/// What has to happen to one keyspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyspaceRefresh {
    Refresh,
    Drop,
    Invalidate(HashSet<SchemaElement>),
}

/// The merged result of all events queued since the last batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshBatch {
    pub topology: bool,
    pub all_keyspaces: bool,
    /// Empty when `all_keyspaces` is set.
    pub keyspaces: HashMap<String, KeyspaceRefresh>,
}

impl RefreshBatch {
    pub fn is_empty(&self) -> bool {
        !self.topology && !self.all_keyspaces && self.keyspaces.is_empty()
    }

    fn add(&mut self, event: RefreshEvent) {
        match event {
            RefreshEvent::Topology => self.topology = true,
            RefreshEvent::AllKeyspaces => {
                self.all_keyspaces = true;
                self.keyspaces.clear();
            }
            _ if self.all_keyspaces => {}
            RefreshEvent::Keyspace(keyspace) => {
                self.keyspaces.insert(keyspace, KeyspaceRefresh::Refresh);
            }
            RefreshEvent::KeyspaceDropped(keyspace) => {
                self.keyspaces.insert(keyspace, KeyspaceRefresh::Drop);
            }
            RefreshEvent::Invalidate { keyspace, target } => {
                let entry = self
                    .keyspaces
                    .entry(keyspace)
                    .or_insert_with(|| KeyspaceRefresh::Invalidate(HashSet::new()));
                if let KeyspaceRefresh::Invalidate(targets) = entry {
                    targets.insert(target);
                } else if *entry == KeyspaceRefresh::Drop {
                    // Something was created in a keyspace we saw dropped: it is back.
                    *entry = KeyspaceRefresh::Refresh;
                }
            }
        }
    }
}

/// Executes merged refreshes.
#[async_trait]
pub trait RefreshHandler: Send + Sync {
    async fn process(&self, batch: RefreshBatch) -> Result<(), MetadataError>;
}

type Waiter = oneshot::Sender<Result<(), MetadataError>>;

enum Message {
    Schedule(RefreshEvent),
    ProcessNow(RefreshEvent, Waiter),
}

/// Handle to the debouncing task. Dropping it stops the task.
pub struct Debouncer {
    sender: mpsc::UnboundedSender<Message>,
    _worker: RemoteHandle<()>,
}

impl Debouncer {
    pub fn new(delay: Duration, max_delay: Duration, handler: Arc<dyn RefreshHandler>) -> Debouncer {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = DebouncerWorker {
            delay,
            max_delay: max_delay.max(delay),
            handler,
            receiver,
            batch: RefreshBatch::default(),
            first_queued: None,
            deadline: None,
            waiters: Vec::new(),
        };
        let (fut, handle) = worker.work().remote_handle();
        tokio::spawn(fut);
        Debouncer {
            sender,
            _worker: handle,
        }
    }

    /// Queues the event and returns immediately.
    pub fn schedule(&self, event: RefreshEvent) {
        trace!("Scheduling refresh: {:?}", event);
        // The worker lives as long as `self`.
        let _ = self.sender.send(Message::Schedule(event));
    }

    /// Queues the event, processes everything queued right away and waits
    /// for the batch to finish.
    pub async fn process_now(&self, event: RefreshEvent) -> Result<(), MetadataError> {
        let (waiter, result) = oneshot::channel();
        self.sender
            .send(Message::ProcessNow(event, waiter))
            .map_err(|_| MetadataError::NotConnected)?;
        result.await.unwrap_or(Err(MetadataError::NotConnected))
    }
}

struct DebouncerWorker {
    delay: Duration,
    max_delay: Duration,
    handler: Arc<dyn RefreshHandler>,
    receiver: mpsc::UnboundedReceiver<Message>,
    batch: RefreshBatch,
    first_queued: Option<Instant>,
    deadline: Option<Instant>,
    waiters: Vec<Waiter>,
}

impl DebouncerWorker {
    async fn work(mut self) {
        loop {
            let deadline = self.deadline;
            let sleep = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                message = self.receiver.recv() => {
                    match message {
                        Some(Message::Schedule(event)) => self.queue(event),
                        Some(Message::ProcessNow(event, waiter)) => {
                            self.queue(event);
                            self.waiters.push(waiter);
                            self.flush().await;
                        }
                        None => return,
                    }
                }
                _ = sleep => self.flush().await,
            }
        }
    }

    fn queue(&mut self, event: RefreshEvent) {
        self.batch.add(event);
        let now = Instant::now();
        let first_queued = *self.first_queued.get_or_insert(now);
        self.deadline = Some((now + self.delay).min(first_queued + self.max_delay));
    }

    async fn flush(&mut self) {
        let batch = std::mem::take(&mut self.batch);
        self.first_queued = None;
        self.deadline = None;
        let waiters = std::mem::take(&mut self.waiters);

        let result = if batch.is_empty() {
            Ok(())
        } else {
            debug!("Processing metadata refresh: {:?}", batch);
            self.handler.process(batch).await
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::setup_tracing;
    use assert_matches::assert_matches;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        batches: StdMutex<Vec<(Instant, RefreshBatch)>>,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl RefreshHandler for Recorder {
        async fn process(&self, batch: RefreshBatch) -> Result<(), MetadataError> {
            self.batches.lock().unwrap().push((Instant::now(), batch));
            if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(MetadataError::EmptyLocalTable);
            }
            Ok(())
        }
    }

    impl Recorder {
        fn batches(&self) -> Vec<RefreshBatch> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .map(|(_, batch)| batch.clone())
                .collect()
        }
    }

    fn table(keyspace: &str, name: &str) -> RefreshEvent {
        RefreshEvent::Invalidate {
            keyspace: keyspace.to_string(),
            target: SchemaElement::Table(name.to_string()),
        }
    }

    fn debouncer(recorder: &Arc<Recorder>) -> Debouncer {
        Debouncer::new(
            Duration::from_millis(100),
            Duration::from_millis(500),
            recorder.clone(),
        )
    }

    #[test]
    fn keyspace_refresh_subsumes_invalidations() {
        let mut batch = RefreshBatch::default();
        batch.add(table("ks", "t1"));
        batch.add(table("ks", "t1"));
        batch.add(table("ks", "t2"));
        batch.add(table("other", "t1"));
        assert_matches!(
            &batch.keyspaces["ks"],
            KeyspaceRefresh::Invalidate(targets) if targets.len() == 2
        );

        batch.add(RefreshEvent::Keyspace("ks".to_string()));
        batch.add(table("ks", "t3"));
        assert_eq!(batch.keyspaces["ks"], KeyspaceRefresh::Refresh);

        batch.add(RefreshEvent::KeyspaceDropped("other".to_string()));
        assert_eq!(batch.keyspaces["other"], KeyspaceRefresh::Drop);
        batch.add(table("other", "t1"));
        assert_eq!(batch.keyspaces["other"], KeyspaceRefresh::Refresh);

        batch.add(RefreshEvent::AllKeyspaces);
        batch.add(RefreshEvent::Keyspace("ks".to_string()));
        assert!(batch.all_keyspaces);
        assert!(batch.keyspaces.is_empty());
        assert!(!batch.topology);
    }

    #[tokio::test]
    async fn burst_of_topology_events_is_processed_once() {
        setup_tracing();
        tokio::time::pause();
        let recorder = Arc::new(Recorder::default());
        let debouncer = debouncer(&recorder);

        for _ in 0..10 {
            debouncer.schedule(RefreshEvent::Topology);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(recorder.batches().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let batches = recorder.batches();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].topology);
    }

    #[tokio::test]
    async fn steady_stream_of_events_is_flushed_after_max_delay() {
        setup_tracing();
        tokio::time::pause();
        let recorder = Arc::new(Recorder::default());
        let debouncer = debouncer(&recorder);

        let start = Instant::now();
        for i in 0..20 {
            debouncer.schedule(table("ks", &format!("t{}", i)));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // The first batch goes out at the latest max_delay after the first
        // event, without waiting for the stream to stop.
        let batches = recorder.batches.lock().unwrap().clone();
        assert!(!batches.is_empty());
        let (flushed_at, first) = &batches[0];
        assert!(*flushed_at - start <= Duration::from_millis(500));
        assert_matches!(
            &first.keyspaces["ks"],
            KeyspaceRefresh::Invalidate(targets) if targets.len() >= 9
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        let invalidated: usize = recorder
            .batches()
            .iter()
            .map(|batch| match &batch.keyspaces["ks"] {
                KeyspaceRefresh::Invalidate(targets) => targets.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(invalidated, 20);
    }

    #[tokio::test]
    async fn process_now_flushes_the_queue_and_reports_the_result() {
        setup_tracing();
        tokio::time::pause();
        let recorder = Arc::new(Recorder::default());
        let debouncer = debouncer(&recorder);

        debouncer.schedule(table("ks", "t1"));
        debouncer
            .process_now(RefreshEvent::Topology)
            .await
            .unwrap();
        let batches = recorder.batches();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].topology);
        assert!(batches[0].keyspaces.contains_key("ks"));

        recorder.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        assert_matches!(
            debouncer.process_now(RefreshEvent::AllKeyspaces).await,
            Err(MetadataError::EmptyLocalTable)
        );

        // Nothing left behind for the timer.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.batches().len(), 2);
    }
}
