//! Typed nodes: JSON records that remember the version they were read at.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::connection::{Connection, CreateMode, NodeData, Version, Watch};
use crate::error::{CoordError, CoordResult};

/// A record stored as JSON in node data.
///
/// The version is never serialized; it is filled in on every read and
/// used as the compare-and-swap token on [`set_node`].
pub trait Node: Serialize + DeserializeOwned + Send + Sync {
    fn version(&self) -> Option<Version>;
    fn set_version(&mut self, version: Option<Version>);
}

/// Implement [`Node`] for a struct with a `version: Option<Version>` field.
#[macro_export]
macro_rules! impl_node {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::Node for $ty {
                fn version(&self) -> Option<$crate::Version> {
                    self.version
                }
                fn set_version(&mut self, version: Option<$crate::Version>) {
                    self.version = version;
                }
            }
        )+
    };
}

pub fn encode<N: Node>(node: &N) -> CoordResult<Vec<u8>> {
    serde_json::to_vec(node).map_err(|e| CoordError::Serialize(e.to_string()))
}

pub fn decode<N: Node>(raw: NodeData) -> CoordResult<N> {
    let mut node: N =
        serde_json::from_slice(&raw.data).map_err(|e| CoordError::Deserialize(e.to_string()))?;
    node.set_version(Some(raw.version));
    Ok(node)
}

pub async fn get_node<N: Node>(conn: &dyn Connection, path: &str) -> CoordResult<N> {
    decode(conn.get(path).await?)
}

pub async fn get_node_w<N: Node>(conn: &dyn Connection, path: &str) -> CoordResult<(N, Watch)> {
    let (raw, watch) = conn.get_w(path).await?;
    Ok((decode(raw)?, watch))
}

/// Create a node from a record; returns the created path.
pub async fn create_node<N: Node>(
    conn: &dyn Connection,
    path: &str,
    node: &N,
    mode: CreateMode,
) -> CoordResult<String> {
    conn.create(path, encode(node)?, mode).await
}

/// Write a record back, guarded by the version it was read at.
pub async fn set_node<N: Node>(conn: &dyn Connection, path: &str, node: &mut N) -> CoordResult<()> {
    let version = conn.set(path, encode(node)?, node.version()).await?;
    node.set_version(Some(version));
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::MemoryStore;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        #[serde(skip)]
        version: Option<Version>,
    }

    crate::impl_node!(Sample);

    #[tokio::test]
    async fn version_tracks_reads_and_writes() {
        let store = MemoryStore::new();
        let conn = store.connect();
        let sample = Sample {
            name: "a".into(),
            version: None,
        };
        create_node(&*conn, "/s", &sample, CreateMode::Persistent)
            .await
            .unwrap();

        let mut first: Sample = get_node(&*conn, "/s").await.unwrap();
        let mut second: Sample = get_node(&*conn, "/s").await.unwrap();
        assert_eq!(first.version, Some(0));

        first.name = "b".into();
        set_node(&*conn, "/s", &mut first).await.unwrap();
        assert_eq!(first.version, Some(1));

        second.name = "c".into();
        let err = set_node(&*conn, "/s", &mut second).await.unwrap_err();
        assert!(matches!(err, CoordError::BadVersion(_)));
    }

    #[test]
    fn version_is_not_serialized() {
        let sample = Sample {
            name: "a".into(),
            version: Some(7),
        };
        let raw = String::from_utf8(encode(&sample).unwrap()).unwrap();
        assert_eq!(raw, r#"{"name":"a"}"#);
    }
}
