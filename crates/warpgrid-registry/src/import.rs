//! Import matching: learn which applications of a tenant export anything.
//!
//! A consumer registers regex terms; each application under
//! `/net/export/<tenantID>` that fully matches a term is reported on
//! that term's channel once.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use regex::Regex;
use tokio::sync::mpsc;
use tracing::debug;
use warpgrid_coord::{Connection, CoordError, Shutdown, shutdown_signalled};

use crate::error::{RegistryError, RegistryResult};
use crate::paths;

struct Term {
    pattern: Regex,
    tx: mpsc::UnboundedSender<String>,
    seen: HashSet<String>,
}

/// Watches a tenant's export directory for applications matching terms.
pub struct ImportListener {
    tenant_id: String,
    terms: Mutex<Vec<Term>>,
}

impl ImportListener {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            terms: Mutex::new(Vec::new()),
        }
    }

    /// Register a term. The pattern is anchored at both ends.
    pub fn add_term(&self, pattern: &str) -> RegistryResult<mpsc::UnboundedReceiver<String>> {
        let compiled = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
            RegistryError::Pattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            }
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.terms.lock().expect("terms lock").push(Term {
            pattern: compiled,
            tx,
            seen: HashSet::new(),
        });
        Ok(rx)
    }

    /// Watch until shutdown.
    pub async fn run(&self, mut shutdown: Shutdown, conn: Arc<dyn Connection>) -> RegistryResult<()> {
        let path = paths::exports_for_tenant(&self.tenant_id);
        loop {
            let (found, exists_watch) = conn.exists_w(&path).await?;
            let (applications, watch) = if found {
                match conn.children_w(&path).await {
                    Ok(listed) => listed,
                    Err(CoordError::NoNode(_)) => continue,
                    Err(e) => return Err(e.into()),
                }
            } else {
                (Vec::new(), exists_watch)
            };
            self.dispatch(&applications);

            tokio::select! {
                _ = watch => {}
                _ = shutdown_signalled(&mut shutdown) => return Ok(()),
            }
        }
    }

    fn dispatch(&self, applications: &[String]) {
        let mut terms = self.terms.lock().expect("terms lock");
        for term in terms.iter_mut() {
            for application in applications {
                if term.pattern.is_match(application) && term.seen.insert(application.clone()) {
                    debug!(
                        tenant = %self.tenant_id,
                        application = %application,
                        term = %term.pattern,
                        "import matched"
                    );
                    let _ = term.tx.send(application.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use warpgrid_coord::{CreateMode, MemoryStore};

    use super::*;

    #[test]
    fn bad_pattern_is_rejected() {
        let listener = ImportListener::new("t1");
        assert!(matches!(
            listener.add_term("(unclosed"),
            Err(RegistryError::Pattern { .. })
        ));
    }

    #[tokio::test]
    async fn reports_each_match_once() {
        let store = MemoryStore::new();
        let conn: Arc<dyn Connection> = store.connect();
        let listener = Arc::new(ImportListener::new("t1"));
        let mut db = listener.add_term("db-.*").unwrap();

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let task = {
            let listener = listener.clone();
            let conn = conn.clone();
            tokio::spawn(async move { listener.run(stop_rx, conn).await })
        };

        conn.create("/net/export/t1/web/0", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        conn.create("/net/export/t1/db-main/0", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        conn.create("/net/export/t1/db-main/1", vec![], CreateMode::Persistent)
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), db.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "db-main");

        conn.create("/net/export/t1/zdb-main/0", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(db.try_recv().is_err());

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
