//! MemoryStore: in-process coordination store.
//!
//! A single shared tree that any number of sessions ([`MemoryConnection`])
//! can attach to. Used by the standalone daemon and by every test in
//! the workspace.
//!
//! # Watch semantics
//!
//! - data watches (`exists_w`, `get_w`) fire on create, delete and data change
//! - child watches (`children_w`) fire when a child is added or removed,
//!   and with `NodeDeleted` when the watched node itself goes away
//! - closing a session reaps its ephemeral nodes and fires `Session`
//!   on every watch it still holds

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::{
    Connection, CreateMode, Event, EventKind, NodeData, Op, Version, Watch,
};
use crate::error::{CoordError, CoordResult};
use crate::path;

type SessionId = u64;

#[derive(Debug, Clone, Default)]
struct Entry {
    data: Vec<u8>,
    version: Version,
    owner: Option<SessionId>,
    next_seq: u64,
}

struct Waiter {
    session: SessionId,
    tx: oneshot::Sender<Event>,
}

/// Pending change notifications collected while the tree is mutated.
type Fired = Vec<(String, EventKind)>;

struct Tree {
    nodes: BTreeMap<String, Entry>,
    data_watches: HashMap<String, Vec<Waiter>>,
    child_watches: HashMap<String, Vec<Waiter>>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Entry::default());
        Self {
            nodes,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
        }
    }

    fn fire(&mut self, fired: Fired) {
        for (node, kind) in fired {
            match kind {
                EventKind::NodeCreated => {
                    self.notify_data(&node, kind);
                    if let Some(parent) = path::parent(&node) {
                        let parent = parent.to_string();
                        self.notify_children(&parent, EventKind::NodeChildrenChanged);
                    }
                }
                EventKind::NodeDeleted => {
                    self.notify_data(&node, kind);
                    self.notify_children(&node, kind);
                    if let Some(parent) = path::parent(&node) {
                        let parent = parent.to_string();
                        self.notify_children(&parent, EventKind::NodeChildrenChanged);
                    }
                }
                _ => self.notify_data(&node, kind),
            }
        }
    }

    fn notify_data(&mut self, node: &str, kind: EventKind) {
        if let Some(waiters) = self.data_watches.remove(node) {
            send_all(waiters, node, kind);
        }
    }

    fn notify_children(&mut self, node: &str, kind: EventKind) {
        if let Some(waiters) = self.child_watches.remove(node) {
            send_all(waiters, node, kind);
        }
    }

    fn drop_session_watches(&mut self, session: SessionId) {
        for watches in [&mut self.data_watches, &mut self.child_watches] {
            for (node, waiters) in watches.iter_mut() {
                let (mine, rest): (Vec<_>, Vec<_>) =
                    waiters.drain(..).partition(|w| w.session == session);
                *waiters = rest;
                send_all(mine, node, EventKind::Session);
            }
            watches.retain(|_, waiters| !waiters.is_empty());
        }
    }
}

fn send_all(waiters: Vec<Waiter>, node: &str, kind: EventKind) {
    for waiter in waiters {
        let _ = waiter.tx.send(Event {
            kind,
            path: node.to_string(),
        });
    }
}

fn child_prefix(node: &str) -> String {
    if node == "/" {
        "/".to_string()
    } else {
        format!("{node}/")
    }
}

fn list_children(nodes: &BTreeMap<String, Entry>, node: &str) -> Vec<String> {
    let prefix = child_prefix(node);
    nodes
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .map(|(k, _)| &k[prefix.len()..])
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
        .map(str::to_string)
        .collect()
}

/// Create missing ancestors of `node` as empty persistent nodes.
fn ensure_parents(
    nodes: &mut BTreeMap<String, Entry>,
    node: &str,
    fired: &mut Fired,
) -> CoordResult<()> {
    let mut ancestors = Vec::new();
    let mut cursor = path::parent(node);
    while let Some(p) = cursor {
        ancestors.push(p.to_string());
        cursor = path::parent(p);
    }
    for ancestor in ancestors.into_iter().rev() {
        match nodes.get(&ancestor) {
            Some(entry) if entry.owner.is_some() => {
                return Err(CoordError::NoChildrenForEphemerals(ancestor));
            }
            Some(_) => {}
            None => {
                nodes.insert(ancestor.clone(), Entry::default());
                fired.push((ancestor, EventKind::NodeCreated));
            }
        }
    }
    Ok(())
}

fn create_in(
    nodes: &mut BTreeMap<String, Entry>,
    raw: &str,
    data: Vec<u8>,
    mode: CreateMode,
    owner: SessionId,
    fired: &mut Fired,
) -> CoordResult<String> {
    let node = match mode {
        CreateMode::EphemeralSequential => {
            // The sequence belongs to the parent of the final path.
            let candidate = path::clean(&format!("{raw}0"))?;
            let parent = path::parent(&candidate)
                .ok_or_else(|| CoordError::InvalidPath(raw.to_string()))?
                .to_string();
            ensure_parents(nodes, &candidate, fired)?;
            let entry = nodes
                .get_mut(&parent)
                .ok_or_else(|| CoordError::NoNode(parent.clone()))?;
            let seq = entry.next_seq;
            entry.next_seq += 1;
            path::clean(&format!("{raw}{seq:010}"))?
        }
        _ => path::clean(raw)?,
    };
    if node == "/" || nodes.contains_key(&node) {
        return Err(CoordError::NodeExists(node));
    }
    ensure_parents(nodes, &node, fired)?;
    let owner = match mode {
        CreateMode::Persistent => None,
        _ => Some(owner),
    };
    nodes.insert(
        node.clone(),
        Entry {
            data,
            version: 0,
            owner,
            next_seq: 0,
        },
    );
    fired.push((node.clone(), EventKind::NodeCreated));
    Ok(node)
}

fn set_in(
    nodes: &mut BTreeMap<String, Entry>,
    node: &str,
    data: Vec<u8>,
    version: Option<Version>,
    fired: &mut Fired,
) -> CoordResult<Version> {
    let entry = nodes
        .get_mut(node)
        .ok_or_else(|| CoordError::NoNode(node.to_string()))?;
    if version.is_some_and(|expected| expected != entry.version) {
        return Err(CoordError::BadVersion(node.to_string()));
    }
    entry.data = data;
    entry.version += 1;
    fired.push((node.to_string(), EventKind::NodeDataChanged));
    Ok(entry.version)
}

fn delete_in(
    nodes: &mut BTreeMap<String, Entry>,
    node: &str,
    fired: &mut Fired,
) -> CoordResult<()> {
    if node == "/" {
        return Err(CoordError::InvalidPath(node.to_string()));
    }
    if !nodes.contains_key(node) {
        return Err(CoordError::NoNode(node.to_string()));
    }
    let prefix = child_prefix(node);
    let mut doomed: Vec<String> = nodes
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .map(|(k, _)| k.clone())
        .collect();
    // Deepest first, so every parent sees its children leave.
    doomed.reverse();
    doomed.push(node.to_string());
    for victim in doomed {
        nodes.remove(&victim);
        fired.push((victim, EventKind::NodeDeleted));
    }
    Ok(())
}

/// Shared in-memory tree. Cheap to clone.
#[derive(Clone)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
    sessions: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
            sessions: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a new session against the tree.
    pub fn connect(&self) -> Arc<MemoryConnection> {
        let session = self.sessions.fetch_add(1, Ordering::Relaxed);
        debug!(session, "memory store session opened");
        Arc::new(MemoryConnection {
            tree: self.tree.clone(),
            session,
            closed: AtomicBool::new(false),
        })
    }

    /// Number of nodes in the tree, root included.
    pub fn node_count(&self) -> usize {
        self.tree.lock().expect("tree lock").nodes.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One session on a [`MemoryStore`].
pub struct MemoryConnection {
    tree: Arc<Mutex<Tree>>,
    session: SessionId,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn check_open(&self) -> CoordResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CoordError::Closed)
        } else {
            Ok(())
        }
    }

    /// Mutate the tree under the lock, then fire whatever changed.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Entry>, &mut Fired) -> CoordResult<T>,
    ) -> CoordResult<T> {
        self.check_open()?;
        let mut tree = self.tree.lock().expect("tree lock");
        let mut fired = Fired::new();
        let out = f(&mut tree.nodes, &mut fired);
        tree.fire(fired);
        out
    }

    fn watch(&self, tree: &mut Tree, node: &str, children: bool) -> Watch {
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            session: self.session,
            tx,
        };
        let table = if children {
            &mut tree.child_watches
        } else {
            &mut tree.data_watches
        };
        table.entry(node.to_string()).or_default().push(waiter);
        Watch::new(node, rx)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> CoordResult<String> {
        let session = self.session;
        self.mutate(|nodes, fired| create_in(nodes, path, data, mode, session, fired))
    }

    async fn create_dir(&self, path: &str) -> CoordResult<()> {
        match self.create(path, Vec::new(), CreateMode::Persistent).await {
            Ok(_) | Err(CoordError::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, path: &str) -> CoordResult<bool> {
        self.check_open()?;
        let node = path::clean(path)?;
        let tree = self.tree.lock().expect("tree lock");
        Ok(tree.nodes.contains_key(&node))
    }

    async fn exists_w(&self, path: &str) -> CoordResult<(bool, Watch)> {
        self.check_open()?;
        let node = path::clean(path)?;
        let mut tree = self.tree.lock().expect("tree lock");
        let found = tree.nodes.contains_key(&node);
        let watch = self.watch(&mut tree, &node, false);
        Ok((found, watch))
    }

    async fn get(&self, path: &str) -> CoordResult<NodeData> {
        self.check_open()?;
        let node = path::clean(path)?;
        let tree = self.tree.lock().expect("tree lock");
        tree.nodes
            .get(&node)
            .map(|e| NodeData {
                data: e.data.clone(),
                version: e.version,
            })
            .ok_or(CoordError::NoNode(node))
    }

    async fn get_w(&self, path: &str) -> CoordResult<(NodeData, Watch)> {
        self.check_open()?;
        let node = path::clean(path)?;
        let mut tree = self.tree.lock().expect("tree lock");
        let data = match tree.nodes.get(&node) {
            Some(e) => NodeData {
                data: e.data.clone(),
                version: e.version,
            },
            None => return Err(CoordError::NoNode(node)),
        };
        let watch = self.watch(&mut tree, &node, false);
        Ok((data, watch))
    }

    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<Version>,
    ) -> CoordResult<Version> {
        let node = path::clean(path)?;
        self.mutate(|nodes, fired| set_in(nodes, &node, data, version, fired))
    }

    async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        self.check_open()?;
        let node = path::clean(path)?;
        let tree = self.tree.lock().expect("tree lock");
        if !tree.nodes.contains_key(&node) {
            return Err(CoordError::NoNode(node));
        }
        Ok(list_children(&tree.nodes, &node))
    }

    async fn children_w(&self, path: &str) -> CoordResult<(Vec<String>, Watch)> {
        self.check_open()?;
        let node = path::clean(path)?;
        let mut tree = self.tree.lock().expect("tree lock");
        if !tree.nodes.contains_key(&node) {
            return Err(CoordError::NoNode(node));
        }
        let children = list_children(&tree.nodes, &node);
        let watch = self.watch(&mut tree, &node, true);
        Ok((children, watch))
    }

    async fn delete(&self, path: &str) -> CoordResult<()> {
        let node = path::clean(path)?;
        self.mutate(|nodes, fired| delete_in(nodes, &node, fired))
    }

    async fn commit(&self, ops: Vec<Op>) -> CoordResult<()> {
        let session = self.session;
        self.mutate(|nodes, fired| {
            let mut staged = nodes.clone();
            let mut staged_fired = Fired::new();
            for op in ops {
                match op {
                    Op::Create { path, data } => {
                        create_in(
                            &mut staged,
                            &path,
                            data,
                            CreateMode::Persistent,
                            session,
                            &mut staged_fired,
                        )?;
                    }
                    Op::Set {
                        path,
                        data,
                        version,
                    } => {
                        let node = path::clean(&path)?;
                        set_in(&mut staged, &node, data, version, &mut staged_fired)?;
                    }
                    Op::Delete { path } => {
                        let node = path::clean(&path)?;
                        delete_in(&mut staged, &node, &mut staged_fired)?;
                    }
                }
            }
            *nodes = staged;
            fired.extend(staged_fired);
            Ok(())
        })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut tree = self.tree.lock().expect("tree lock");
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, e)| e.owner == Some(self.session))
            .map(|(k, _)| k.clone())
            .collect();
        let mut fired = Fired::new();
        for node in &owned {
            // Ephemerals have no children, so a plain delete suffices.
            if tree.nodes.remove(node).is_some() {
                fired.push((node.clone(), EventKind::NodeDeleted));
            }
        }
        tree.drop_session_watches(self.session);
        tree.fire(fired);
        debug!(session = self.session, reaped = owned.len(), "memory store session closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn fired(watch: Watch) -> Event {
        tokio::time::timeout(Duration::from_secs(1), watch)
            .await
            .expect("watch should fire")
    }

    #[tokio::test]
    async fn create_builds_parents_and_fires_exists_watch() {
        let store = MemoryStore::new();
        let conn = store.connect();
        let (found, watch) = conn.exists_w("/net/export/t1/app1").await.unwrap();
        assert!(!found);

        conn.create("/net/export/t1/app1/x", b"{}".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        let event = fired(watch).await;
        assert_eq!(event.kind, EventKind::NodeCreated);
        assert_eq!(event.path, "/net/export/t1/app1");
        assert_eq!(conn.children("/net/export/t1/app1").await.unwrap(), vec!["x"]);
    }

    #[tokio::test]
    async fn sequential_names_are_zero_padded_and_increasing() {
        let store = MemoryStore::new();
        let conn = store.connect();
        let a = conn
            .create("/net/export/t1/app1/", vec![], CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let b = conn
            .create("/net/export/t1/app1/", vec![], CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(a, "/net/export/t1/app1/0000000000");
        assert_eq!(b, "/net/export/t1/app1/0000000001");
    }

    #[tokio::test]
    async fn set_with_stale_version_is_rejected() {
        let store = MemoryStore::new();
        let conn = store.connect();
        conn.create("/a", b"1".to_vec(), CreateMode::Persistent).await.unwrap();
        let v = conn.set("/a", b"2".to_vec(), Some(0)).await.unwrap();
        assert_eq!(v, 1);
        let err = conn.set("/a", b"3".to_vec(), Some(0)).await.unwrap_err();
        assert_eq!(err, CoordError::BadVersion("/a".into()));
        assert_eq!(conn.get("/a").await.unwrap().data, b"2".to_vec());
    }

    #[tokio::test]
    async fn delete_is_recursive_and_fires_child_watch() {
        let store = MemoryStore::new();
        let conn = store.connect();
        conn.create("/a/b/c", vec![], CreateMode::Persistent).await.unwrap();
        let (_, watch) = conn.children_w("/a").await.unwrap();
        conn.delete("/a/b").await.unwrap();
        assert_eq!(fired(watch).await.kind, EventKind::NodeChildrenChanged);
        assert!(!conn.exists("/a/b/c").await.unwrap());
        assert!(conn.exists("/a").await.unwrap());
    }

    #[tokio::test]
    async fn closing_a_session_reaps_ephemerals() {
        let store = MemoryStore::new();
        let owner = store.connect();
        let observer = store.connect();
        owner
            .create("/e/node", vec![], CreateMode::Ephemeral)
            .await
            .unwrap();
        let (_, watch) = observer.children_w("/e").await.unwrap();
        let (_, own_watch) = owner.exists_w("/e/node").await.unwrap();

        owner.close().await;

        assert_eq!(fired(watch).await.kind, EventKind::NodeChildrenChanged);
        assert_eq!(fired(own_watch).await.kind, EventKind::Session);
        assert!(!observer.exists("/e/node").await.unwrap());
        assert_eq!(owner.exists("/e").await, Err(CoordError::Closed));
    }

    #[tokio::test]
    async fn ephemeral_nodes_cannot_have_children() {
        let store = MemoryStore::new();
        let conn = store.connect();
        conn.create("/e", vec![], CreateMode::Ephemeral).await.unwrap();
        let err = conn
            .create("/e/child", vec![], CreateMode::Persistent)
            .await
            .unwrap_err();
        assert_eq!(err, CoordError::NoChildrenForEphemerals("/e".into()));
    }

    #[tokio::test]
    async fn failed_commit_changes_nothing() {
        let store = MemoryStore::new();
        let conn = store.connect();
        conn.create("/keep", vec![], CreateMode::Persistent).await.unwrap();
        let err = conn
            .commit(vec![
                Op::Create {
                    path: "/new".into(),
                    data: vec![],
                },
                Op::Delete {
                    path: "/missing".into(),
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::NoNode(_)));
        assert!(!conn.exists("/new").await.unwrap());
        assert!(conn.exists("/keep").await.unwrap());
    }
}
