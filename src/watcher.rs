use std::sync::Arc;

use async_trait::async_trait;
use backoff::Backoff;
use consul::QueryOptions;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::target::{Target, TargetSet};

fn default_filter_tags() -> Vec<String> {
    vec!["http".to_string()]
}

fn default_filter_services() -> Vec<String> {
    vec!["nomad".to_string(), "consul".to_string()]
}

/// The position of a watch in the catalog's change history.
///
/// An unset cursor turns the next query into a plain, non-blocking read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct WatchCursor(u64);

impl WatchCursor {
    pub const UNSET: WatchCursor = WatchCursor(0);

    pub const fn new(index: u64) -> Self {
        WatchCursor(index)
    }

    pub const fn index(&self) -> u64 {
        self.0
    }

    pub const fn is_set(&self) -> bool {
        self.0 != 0
    }

    /// Move the cursor forward to `index`, an older index is ignored.
    ///
    /// A response without an index still sets the cursor, otherwise every
    /// following query would be non-blocking.
    pub fn advance(&mut self, index: u64) {
        self.0 = self.0.max(index).max(1);
    }
}

/// Restricts the catalog query to instances carrying `tags`, but only for the
/// services listed in `services`. Every other service is queried without any
/// tag.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TagFilter {
    #[serde(default = "default_filter_tags")]
    pub tags: Vec<String>,

    #[serde(default = "default_filter_services")]
    pub services: Vec<String>,
}

impl Default for TagFilter {
    fn default() -> Self {
        TagFilter {
            tags: default_filter_tags(),
            services: default_filter_services(),
        }
    }
}

impl TagFilter {
    pub fn tags_for(&self, service: &str) -> &[String] {
        if self.services.iter().any(|name| name == service) {
            &self.tags
        } else {
            &[]
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogSnapshot {
    /// Healthy instances of the service
    pub targets: TargetSet,

    /// The catalog index this view was read at
    pub index: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Consul(#[from] consul::Error),
}

/// Read access to the service catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Healthy instances of `service`. A set cursor blocks until the catalog
    /// moved past it or the server side wait elapsed.
    async fn query(
        &self,
        service: &str,
        tags: &[String],
        datacenter: Option<&str>,
        cursor: WatchCursor,
    ) -> Result<CatalogSnapshot, CatalogError>;
}

pub struct ConsulCatalog {
    client: consul::Client,
}

impl ConsulCatalog {
    pub fn new(client: consul::Client) -> Self {
        ConsulCatalog { client }
    }
}

#[async_trait]
impl Catalog for ConsulCatalog {
    async fn query(
        &self,
        service: &str,
        tags: &[String],
        datacenter: Option<&str>,
        cursor: WatchCursor,
    ) -> Result<CatalogSnapshot, CatalogError> {
        let opts = QueryOptions {
            datacenter: datacenter.map(ToString::to_string),
            wait_index: cursor.index(),
        };

        let (entries, meta) = self
            .client
            .health_service(service, tags, true, &opts)
            .await?;

        let targets = entries
            .iter()
            .filter_map(|entry| {
                let address = entry.address();
                if address.is_empty() {
                    warn!(
                        message = "skip service instance without address",
                        service,
                        id = entry.service.id,
                        node = entry.node.node
                    );

                    return None;
                }

                Some(Target::new(address, entry.service.port))
            })
            .collect();

        Ok(CatalogSnapshot {
            targets,
            index: meta.last_index,
        })
    }
}

/// Turns catalog queries of one service into target set snapshots.
pub struct CatalogWatcher {
    catalog: Arc<dyn Catalog>,
    service: String,
    tags: Vec<String>,
    datacenter: Option<String>,
    retry: Backoff,
}

impl CatalogWatcher {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        service: impl Into<String>,
        filter: &TagFilter,
        datacenter: Option<String>,
        retry: Backoff,
    ) -> Self {
        let service = service.into();
        let tags = filter.tags_for(&service).to_vec();

        CatalogWatcher {
            catalog,
            service,
            tags,
            datacenter,
            retry,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// The current healthy instances, read without blocking.
    pub async fn snapshot(&self) -> Result<TargetSet, CatalogError> {
        let snapshot = self
            .catalog
            .query(
                &self.service,
                &self.tags,
                self.datacenter.as_deref(),
                WatchCursor::UNSET,
            )
            .await?;

        Ok(snapshot.targets)
    }

    /// An endless stream of snapshots, one per successful catalog response.
    ///
    /// Failed queries are logged and retried after a delay, they never end the
    /// stream and never yield.
    pub fn watch(self, cursor: WatchCursor) -> impl Stream<Item = TargetSet> + Send + 'static {
        futures::stream::unfold((self, cursor), |(mut watcher, mut cursor)| async move {
            loop {
                let result = watcher
                    .catalog
                    .query(
                        &watcher.service,
                        &watcher.tags,
                        watcher.datacenter.as_deref(),
                        cursor,
                    )
                    .await;

                match result {
                    Ok(snapshot) => {
                        watcher.retry.reset();
                        cursor.advance(snapshot.index);

                        debug!(
                            message = "catalog snapshot received",
                            service = watcher.service,
                            index = snapshot.index,
                            targets = snapshot.targets.len()
                        );

                        return Some((snapshot.targets, (watcher, cursor)));
                    }
                    Err(err) => {
                        let delay = watcher.retry.next_delay();

                        warn!(
                            message = "query catalog failed",
                            service = watcher.service,
                            index = cursor.index(),
                            ?delay,
                            %err
                        );

                        tokio::time::sleep(delay).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::testing::ConsulServer;

    pub(crate) fn targets(items: &[(&str, u16)]) -> TargetSet {
        items
            .iter()
            .map(|(id, port)| Target::new(*id, *port))
            .collect()
    }

    #[derive(Clone, Debug, PartialEq)]
    pub(crate) struct Query {
        pub service: String,
        pub tags: Vec<String>,
        pub datacenter: Option<String>,
        pub cursor: WatchCursor,
    }

    /// Replies with scripted responses, the last one is repeated forever.
    ///
    /// A blocking query for the repeated response waits out the whole
    /// blocking time first, the way Consul does when nothing changed.
    #[derive(Default)]
    pub(crate) struct FakeCatalog {
        responses: Mutex<VecDeque<Result<CatalogSnapshot, ()>>>,
        served_last: Mutex<bool>,
        queries: Mutex<Vec<Query>>,
    }

    impl FakeCatalog {
        pub(crate) fn new() -> Self {
            FakeCatalog::default()
        }

        pub(crate) fn push_ok(&self, index: u64, items: &[(&str, u16)]) {
            self.responses.lock().unwrap().push_back(Ok(CatalogSnapshot {
                targets: targets(items),
                index,
            }));
        }

        pub(crate) fn push_err(&self) {
            self.responses.lock().unwrap().push_back(Err(()));
        }

        pub(crate) fn queries(&self) -> Vec<Query> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Catalog for FakeCatalog {
        async fn query(
            &self,
            service: &str,
            tags: &[String],
            datacenter: Option<&str>,
            cursor: WatchCursor,
        ) -> Result<CatalogSnapshot, CatalogError> {
            self.queries.lock().unwrap().push(Query {
                service: service.to_string(),
                tags: tags.to_vec(),
                datacenter: datacenter.map(ToString::to_string),
                cursor,
            });

            let (response, unchanged) = {
                let mut responses = self.responses.lock().unwrap();
                if responses.len() > 1 {
                    (responses.pop_front(), false)
                } else {
                    let mut served_last = self.served_last.lock().unwrap();
                    let unchanged = *served_last;
                    *served_last = true;

                    (responses.front().cloned(), unchanged)
                }
            };

            if unchanged && cursor.is_set() {
                tokio::time::sleep(Duration::from_secs(300)).await;
            }

            match response {
                Some(Ok(snapshot)) => Ok(snapshot),
                _ => Err(CatalogError::Consul(consul::Error::Timeout(
                    Duration::from_secs(1),
                ))),
            }
        }
    }

    fn watcher(catalog: Arc<FakeCatalog>, service: &str) -> CatalogWatcher {
        CatalogWatcher::new(
            catalog,
            service,
            &TagFilter::default(),
            Some("dc1".to_string()),
            Backoff::new(Duration::from_secs(1), Duration::from_secs(4)),
        )
    }

    #[test]
    fn cursor_is_monotonic() {
        let mut cursor = WatchCursor::UNSET;
        assert!(!cursor.is_set());

        cursor.advance(10);
        assert_eq!(cursor.index(), 10);

        cursor.advance(7);
        assert_eq!(cursor.index(), 10);

        cursor.advance(12);
        assert_eq!(cursor.index(), 12);

        let mut cursor = WatchCursor::UNSET;
        cursor.advance(0);
        assert!(cursor.is_set());
    }

    #[test]
    fn tag_filter_only_for_listed_services() {
        let filter = TagFilter::default();

        assert_eq!(filter.tags_for("nomad"), ["http".to_string()]);
        assert_eq!(filter.tags_for("consul"), ["http".to_string()]);
        assert!(filter.tags_for("api").is_empty());

        let filter = TagFilter {
            tags: vec!["lb".to_string()],
            services: vec!["api".to_string()],
        };
        assert_eq!(filter.tags_for("api"), ["lb".to_string()]);
        assert!(filter.tags_for("nomad").is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_non_blocking() {
        let catalog = Arc::new(FakeCatalog::new());
        catalog.push_ok(42, &[("10.0.0.1", 80), ("10.0.0.2", 80)]);

        let watcher = watcher(Arc::clone(&catalog), "nomad");
        let got = watcher.snapshot().await.unwrap();
        assert_eq!(got, targets(&[("10.0.0.1", 80), ("10.0.0.2", 80)]));

        assert_eq!(
            catalog.queries(),
            vec![Query {
                service: "nomad".to_string(),
                tags: vec!["http".to_string()],
                datacenter: Some("dc1".to_string()),
                cursor: WatchCursor::UNSET,
            }]
        );
    }

    #[tokio::test]
    async fn snapshot_error() {
        let catalog = Arc::new(FakeCatalog::new());
        catalog.push_err();

        let watcher = watcher(Arc::clone(&catalog), "api");
        assert!(watcher.snapshot().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_passes_cursor() {
        let catalog = Arc::new(FakeCatalog::new());
        catalog.push_ok(10, &[("10.0.0.1", 80)]);
        catalog.push_ok(12, &[("10.0.0.1", 80), ("10.0.0.2", 80)]);
        // index went backwards, cursor must not follow
        catalog.push_ok(11, &[]);

        let stream = watcher(Arc::clone(&catalog), "api").watch(WatchCursor::UNSET);
        let got = stream.take(4).collect::<Vec<_>>().await;

        assert_eq!(
            got,
            vec![
                targets(&[("10.0.0.1", 80)]),
                targets(&[("10.0.0.1", 80), ("10.0.0.2", 80)]),
                TargetSet::new(),
                TargetSet::new(),
            ]
        );

        let cursors = catalog
            .queries()
            .iter()
            .map(|query| query.cursor.index())
            .collect::<Vec<_>>();
        assert_eq!(cursors, vec![0, 10, 12, 12]);

        // not in the allow list, so no tag filter
        assert!(catalog.queries().iter().all(|query| query.tags.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_retries_with_backoff() {
        let catalog = Arc::new(FakeCatalog::new());
        catalog.push_ok(5, &[("10.0.0.1", 80)]);
        catalog.push_err();
        catalog.push_err();
        catalog.push_err();
        catalog.push_ok(9, &[("10.0.0.3", 80)]);

        let mut stream = Box::pin(watcher(Arc::clone(&catalog), "api").watch(WatchCursor::UNSET));

        assert_eq!(stream.next().await, Some(targets(&[("10.0.0.1", 80)])));

        let start = tokio::time::Instant::now();
        assert_eq!(stream.next().await, Some(targets(&[("10.0.0.3", 80)])));
        // 1s + 2s + 4s
        assert_eq!(start.elapsed(), Duration::from_secs(7));

        // failed queries keep the cursor where it was
        let cursors = catalog
            .queries()
            .iter()
            .map(|query| query.cursor.index())
            .collect::<Vec<_>>();
        assert_eq!(cursors, vec![0, 5, 5, 5, 5]);
    }

    #[tokio::test]
    async fn consul_catalog() {
        let server = ConsulServer::new()
            .route(
                "/v1/health/service/nomad",
                Some(17),
                r#"[
                    {
                        "Node": {"Node": "n1", "Address": "10.0.0.101"},
                        "Service": {"ID": "nomad-1", "Service": "nomad", "Tags": ["http"], "Address": "10.0.0.1", "Port": 4646}
                    },
                    {
                        "Node": {"Node": "n2", "Address": "10.0.0.2"},
                        "Service": {"ID": "nomad-2", "Service": "nomad", "Tags": ["http"], "Address": "", "Port": 4646}
                    },
                    {
                        "Node": {"Node": "n3", "Address": ""},
                        "Service": {"ID": "nomad-3", "Service": "nomad", "Tags": ["http"], "Port": 4646}
                    }
                ]"#,
            )
            .start()
            .await;
        let catalog = ConsulCatalog::new(server.client());

        let snapshot = catalog
            .query(
                "nomad",
                &["http".to_string()],
                Some("dc2"),
                WatchCursor::new(5),
            )
            .await
            .unwrap();

        // the instance without any address is dropped, the second one
        // falls back to its node address
        assert_eq!(
            snapshot.targets,
            targets(&[("10.0.0.1", 4646), ("10.0.0.2", 4646)])
        );
        assert_eq!(snapshot.index, 17);

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        for param in ["passing=1", "tag=http", "dc=dc2", "index=5", "wait="] {
            assert!(requests[0].contains(param), "{param} in {}", requests[0]);
        }
    }

    #[tokio::test]
    async fn consul_catalog_unknown_service() {
        let server = ConsulServer::new().start().await;
        let catalog = ConsulCatalog::new(server.client());

        // a 404 is an error, never an empty catalog
        let result = catalog
            .query("missing", &[], None, WatchCursor::UNSET)
            .await;
        assert!(matches!(result, Err(CatalogError::Consul(_))));

        let requests = server.requests();
        assert!(!requests[0].contains("index="), "{}", requests[0]);
        assert!(!requests[0].contains("tag="), "{}", requests[0]);
    }
}
