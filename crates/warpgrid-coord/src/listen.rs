//! Child listeners: one task per child of a watched directory.
//!
//! [`listen`] waits for a base path, then keeps exactly one
//! [`Listener::spawn`] task alive for each child node it sees. A child
//! task that returns while its node still exists is parked and only
//! started again after that node changes or is deleted. When the base
//! path is deleted or shutdown is signalled, every child task is told
//! to stop and awaited before [`Listener::done`] runs.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::connection::{Connection, EventKind};
use crate::error::{CoordError, CoordResult};
use crate::path::join;

/// Cooperative cancellation signal. `true` (or a dropped sender) means stop.
pub type Shutdown = watch::Receiver<bool>;

/// Resolve once shutdown has been requested.
pub async fn shutdown_signalled(shutdown: &mut Shutdown) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// True if shutdown has already been requested.
pub fn is_shutdown(shutdown: &Shutdown) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Block until `path` exists. Returns `false` if shutdown came first.
pub async fn wait_for_path(
    shutdown: &mut Shutdown,
    conn: &dyn Connection,
    path: &str,
) -> CoordResult<bool> {
    loop {
        let (found, watch) = conn.exists_w(path).await?;
        if found {
            return Ok(true);
        }
        tokio::select! {
            _ = watch => {}
            _ = shutdown_signalled(shutdown) => return Ok(false),
        }
    }
}

/// Behaviour plugged into [`listen`].
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Directory whose children are listened on.
    fn path(&self) -> String;

    /// Called once the directory exists, and again after a session event.
    async fn ready(&self) -> CoordResult<()> {
        Ok(())
    }

    /// Called after every child task has finished.
    async fn done(&self) {}

    /// Run for one child until it goes away or `shutdown` fires.
    async fn spawn(&self, shutdown: Shutdown, node: String);

    /// Called after each pass with the children currently being handled.
    async fn post_process(&self, _processing: &BTreeSet<String>) {}
}

/// Drive a [`Listener`] until its directory is deleted or shutdown fires.
pub async fn listen<L: Listener>(
    mut shutdown: Shutdown,
    conn: Arc<dyn Connection>,
    listener: Arc<L>,
) -> CoordResult<()> {
    let (child_tx, child_rx) = watch::channel(false);
    let mut children = Children {
        tasks: JoinSet::new(),
        names: HashMap::new(),
        parked: JoinSet::new(),
        processing: BTreeSet::new(),
    };

    let result = run(&mut shutdown, &conn, &listener, &child_rx, &mut children).await;

    let _ = child_tx.send(true);
    while children.tasks.join_next().await.is_some() {}
    while children.parked.join_next().await.is_some() {}
    listener.done().await;
    debug!(path = %listener.path(), "listener stopped");
    result
}

struct Children {
    tasks: JoinSet<()>,
    names: HashMap<tokio::task::Id, String>,
    /// Finished children waiting for their node to change.
    parked: JoinSet<String>,
    processing: BTreeSet<String>,
}

impl Children {
    /// Hold `name` in `processing` until its node changes or goes away.
    fn park(&mut self, conn: &Arc<dyn Connection>, base: &str, name: String, child_rx: &Shutdown) {
        let conn = conn.clone();
        let node = join(&[base, name.as_str()]);
        let mut shutdown = child_rx.clone();
        self.parked.spawn(async move {
            if let Ok((true, watch)) = conn.exists_w(&node).await {
                debug!(path = %node, "child listener finished, waiting for the node to change");
                tokio::select! {
                    _ = watch => {}
                    _ = shutdown_signalled(&mut shutdown) => {}
                }
            }
            name
        });
    }
}

async fn run<L: Listener>(
    shutdown: &mut Shutdown,
    conn: &Arc<dyn Connection>,
    listener: &Arc<L>,
    child_rx: &Shutdown,
    children: &mut Children,
) -> CoordResult<()> {
    let base = listener.path();
    if !wait_for_path(shutdown, &**conn, &base).await? {
        return Ok(());
    }
    listener.ready().await?;

    loop {
        let (names, watch) = match conn.children_w(&base).await {
            Ok(found) => found,
            Err(CoordError::NoNode(_)) => {
                debug!(path = %base, "listener path removed");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for name in names {
            if children.processing.insert(name.clone()) {
                let l = listener.clone();
                let rx = child_rx.clone();
                let node = name.clone();
                let handle = children.tasks.spawn(async move { l.spawn(rx, node).await });
                children.names.insert(handle.id(), name);
            }
        }
        listener.post_process(&children.processing).await;

        tokio::select! {
            event = watch => match event.kind {
                EventKind::NodeDeleted => {
                    debug!(path = %base, "listener path deleted");
                    return Ok(());
                }
                EventKind::Session | EventKind::NotWatching => {
                    if !wait_for_path(shutdown, &**conn, &base).await? {
                        return Ok(());
                    }
                    listener.ready().await?;
                }
                _ => {}
            },
            Some(joined) = children.tasks.join_next_with_id() => {
                let id = match &joined {
                    Ok((id, _)) => *id,
                    Err(e) => {
                        warn!(path = %base, error = %e, "child listener task failed");
                        e.id()
                    }
                };
                if let Some(name) = children.names.remove(&id) {
                    children.park(conn, &base, name, child_rx);
                }
            }
            Some(parked) = children.parked.join_next() => match parked {
                Ok(name) => {
                    children.processing.remove(&name);
                }
                Err(e) => warn!(path = %base, error = %e, "parked child task failed"),
            },
            _ = shutdown_signalled(shutdown) => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{CreateMode, MemoryStore};

    struct Recorder {
        path: String,
        conn: Arc<dyn Connection>,
        started: mpsc::UnboundedSender<String>,
        stopped: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Listener for Recorder {
        fn path(&self) -> String {
            self.path.clone()
        }

        async fn spawn(&self, mut shutdown: Shutdown, node: String) {
            let _ = self.started.send(node.clone());
            let child = format!("{}/{}", self.path, node);
            loop {
                let Ok((true, watch)) = self.conn.exists_w(&child).await else {
                    break;
                };
                tokio::select! {
                    _ = watch => {}
                    _ = shutdown_signalled(&mut shutdown) => break,
                }
            }
            self.stopped.lock().expect("stopped lock").push(node);
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("child should start")
            .expect("channel open")
    }

    #[tokio::test]
    async fn spawns_once_per_child_and_stops_all_on_shutdown() {
        let store = MemoryStore::new();
        let conn: Arc<dyn Connection> = store.connect();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            path: "/net/pub/hostA".into(),
            conn: conn.clone(),
            started: tx,
            stopped: Mutex::new(Vec::new()),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(listen(stop_rx, conn.clone(), recorder.clone()));

        // Base path does not exist yet; listen waits for it.
        conn.create("/net/pub/hostA/:80", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, ":80");

        conn.create("/net/pub/hostA/:443", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, ":443");

        conn.set("/net/pub/hostA/:80", b"x".to_vec(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "no duplicate spawn");

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let mut stopped = recorder.stopped.lock().unwrap().clone();
        stopped.sort();
        assert_eq!(stopped, vec![":443", ":80"]);
    }

    #[tokio::test]
    async fn returns_when_base_path_is_deleted() {
        let store = MemoryStore::new();
        let conn: Arc<dyn Connection> = store.connect();
        conn.create("/net/vhost/hostA/www", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            path: "/net/vhost/hostA".into(),
            conn: conn.clone(),
            started: tx,
            stopped: Mutex::new(Vec::new()),
        });
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(listen(stop_rx, conn.clone(), recorder.clone()));
        assert_eq!(recv(&mut rx).await, "www");

        conn.delete("/net/vhost/hostA").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(*recorder.stopped.lock().unwrap(), vec!["www".to_string()]);
    }

    /// Returns from every child task at once, as a listener does when
    /// its record cannot be read.
    struct QuitsAtOnce {
        spawned: AtomicUsize,
    }

    #[async_trait]
    impl Listener for QuitsAtOnce {
        fn path(&self) -> String {
            "/net/pub/hostA".into()
        }

        async fn spawn(&self, _shutdown: Shutdown, _node: String) {
            self.spawned.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn finished_child_waits_for_its_node_to_change() {
        let store = MemoryStore::new();
        let conn: Arc<dyn Connection> = store.connect();
        conn.create("/net/pub/hostA/:80", b"garbage".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        let listener = Arc::new(QuitsAtOnce {
            spawned: AtomicUsize::new(0),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(listen(stop_rx, conn.clone(), listener.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(listener.spawned.load(Ordering::SeqCst), 1);

        conn.set("/net/pub/hostA/:80", b"rewritten".to_vec(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(listener.spawned.load(Ordering::SeqCst), 2);

        conn.delete("/net/pub/hostA/:80").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(listener.spawned.load(Ordering::SeqCst), 2);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
