use std::sync::Arc;
use std::time::Duration;

use exitcode::ExitCode;
use tracing::{error, info};
use tripwire::Tripwire;

use crate::config::{Config, RetryConfig};
use crate::reconcile::{Applied, ReconcileError, Reconciler};
use crate::resolver::{
    AwsClientFactory, ClientFactory, ConsulTargetGroups, ResolveError, Resolver,
    StaticCredentials, TargetGroupBinding, TargetGroupStore,
};
use crate::watcher::{Catalog, CatalogError, CatalogWatcher, ConsulCatalog, TagFilter, WatchCursor};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("build consul client failed, {0}")]
    Consul(consul::Error),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("query catalog of service {service} failed, {source}")]
    Catalog {
        service: String,
        source: CatalogError,
    },
    #[error("reconcile service {service} failed, {source}")]
    Reconcile {
        service: String,
        source: ReconcileError,
    },
}

impl Error {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::Consul(_)
            | Error::Resolve(ResolveError::InvalidArn { .. })
            | Error::Resolve(ResolveError::Credentials { .. }) => exitcode::CONFIG,
            _ => exitcode::UNAVAILABLE,
        }
    }
}

/// Entry points of the reconciliation, one-shot and continuous.
pub struct App {
    datacenter: Option<String>,
    catalog: Arc<dyn Catalog>,
    tag_filter: TagFilter,
    resolver: Resolver,
    settle_delay: Duration,
    retry: RetryConfig,
}

impl App {
    pub fn new(config: &Config) -> Result<App, Error> {
        let client = consul::Client::new(&config.consul).map_err(Error::Consul)?;
        let catalog = Arc::new(ConsulCatalog::new(client.clone()));
        let store = Arc::new(ConsulTargetGroups::new(client, &config.target_groups));
        let credentials = Arc::new(StaticCredentials::new(&config.aws));
        let factory = Arc::new(AwsClientFactory::new(credentials));

        Ok(App::from_parts(config, catalog, store, factory))
    }

    pub fn from_parts(
        config: &Config,
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn TargetGroupStore>,
        factory: Arc<dyn ClientFactory>,
    ) -> App {
        App {
            datacenter: config.datacenter.clone(),
            catalog,
            tag_filter: config.catalog.clone(),
            resolver: Resolver::new(store, factory, &config.identity),
            settle_delay: config.reconcile.settle_delay,
            retry: config.reconcile.retry.clone(),
        }
    }

    fn datacenter<'a>(&'a self, datacenter: Option<&'a str>) -> Option<&'a str> {
        datacenter.or(self.datacenter.as_deref())
    }

    fn watcher(&self, binding: &TargetGroupBinding) -> CatalogWatcher {
        CatalogWatcher::new(
            Arc::clone(&self.catalog),
            binding.service.as_str(),
            &self.tag_filter,
            binding.datacenter.clone(),
            self.retry.backoff(),
        )
    }

    /// Every `(service, target group)` pair currently configured.
    pub async fn target_groups(&self) -> Result<Vec<(String, String)>, Error> {
        Ok(self.resolver.services().await?)
    }

    async fn reconcile_binding(&self, binding: &TargetGroupBinding) -> Result<Applied, Error> {
        let desired = self
            .watcher(binding)
            .snapshot()
            .await
            .map_err(|source| Error::Catalog {
                service: binding.service.clone(),
                source,
            })?;

        Reconciler::new(binding)
            .reconcile(&desired)
            .await
            .map_err(|source| Error::Reconcile {
                service: binding.service.clone(),
                source,
            })
    }

    /// One pass over every configured target group, one after another.
    ///
    /// A failing service does not stop the others, every outcome is
    /// returned. Only failing to list the target groups fails as a whole.
    pub async fn reconcile_all(
        &self,
        datacenter: Option<&str>,
    ) -> Result<Vec<(String, Result<Applied, Error>)>, Error> {
        let datacenter = self.datacenter(datacenter);
        let target_groups = self.target_groups().await?;

        info!(
            message = "reconcile all target groups",
            datacenter,
            count = target_groups.len()
        );

        let mut outcomes = Vec::with_capacity(target_groups.len());
        for (service, arn) in target_groups {
            let result = match self.resolver.bind(&service, &arn, datacenter).await {
                Ok(binding) => self.reconcile_binding(&binding).await,
                Err(err) => Err(err.into()),
            };

            if let Err(err) = &result {
                error!(message = "reconcile failed", service, %err);
            }

            outcomes.push((service, result));
        }

        Ok(outcomes)
    }

    /// One pass for a single service, after the settle delay passed.
    ///
    /// `None` means the service has no target group and was skipped.
    pub async fn reconcile_one(
        &self,
        service: &str,
        datacenter: Option<&str>,
    ) -> Result<Option<Applied>, Error> {
        let datacenter = self.datacenter(datacenter);
        let Some(binding) = self.resolver.resolve(service, datacenter).await? else {
            return Ok(None);
        };

        if !self.settle_delay.is_zero() {
            info!(
                message = "wait for instances to settle",
                service,
                delay = ?self.settle_delay
            );

            tokio::time::sleep(self.settle_delay).await;
        }

        self.reconcile_binding(&binding).await.map(Some)
    }

    /// Keep the target group of `service` in sync until `tripwire` fires.
    ///
    /// Returns right away if the service has no target group.
    pub async fn watch_forever(
        &self,
        service: &str,
        datacenter: Option<&str>,
        mut tripwire: Tripwire,
    ) -> Result<(), Error> {
        let datacenter = self.datacenter(datacenter);
        let binding = tokio::select! {
            biased;

            _ = &mut tripwire => return Ok(()),
            result = self.resolver.resolve(service, datacenter) => match result? {
                Some(binding) => binding,
                None => return Ok(()),
            },
        };

        let snapshots = self.watcher(&binding).watch(WatchCursor::UNSET);
        Reconciler::new(&binding).run(snapshots, tripwire).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::balancer::tests::{Call, FakeBalancer};
    use crate::resolver::tests::{API_ARN, FakeFactory, FakeStore, WEB_ARN};
    use crate::target::TargetSet;
    use crate::watcher::tests::{FakeCatalog, targets};

    struct Fixture {
        app: Arc<App>,
        catalog: Arc<FakeCatalog>,
        balancer: Arc<FakeBalancer>,
    }

    fn fixture(groups: &[(&str, &str)], balancer: FakeBalancer) -> Fixture {
        let config = Config {
            datacenter: Some("dc1".to_string()),
            ..Config::default()
        };
        let catalog = Arc::new(FakeCatalog::new());
        let balancer = Arc::new(balancer);
        let factory = Arc::new(FakeFactory::new(Arc::clone(&balancer)));

        let app = App::from_parts(
            &config,
            Arc::clone(&catalog) as Arc<dyn Catalog>,
            Arc::new(FakeStore::new(groups)),
            factory,
        );

        Fixture {
            app: Arc::new(app),
            catalog,
            balancer,
        }
    }

    #[tokio::test]
    async fn reconcile_all_continues_past_failures() {
        let fixture = fixture(
            &[("api", API_ARN), ("broken", "targetgroup/broken"), ("web", WEB_ARN)],
            FakeBalancer::healthy(&[("10.0.0.9", 80)]),
        );
        fixture.catalog.push_ok(3, &[("10.0.0.1", 80)]);

        let outcomes = fixture.app.reconcile_all(None).await.unwrap();
        let services = outcomes
            .iter()
            .map(|(service, _)| service.as_str())
            .collect::<Vec<_>>();
        assert_eq!(services, vec!["api", "broken", "web"]);

        assert!(outcomes[0].1.is_ok());
        match &outcomes[1].1 {
            Err(err) => assert_eq!(err.exit_code(), exitcode::CONFIG),
            Ok(_) => panic!("invalid arn must fail"),
        }
        assert!(outcomes[2].1.is_ok());

        // the default datacenter is used for every catalog query
        assert!(
            fixture
                .catalog
                .queries()
                .iter()
                .all(|query| query.datacenter.as_deref() == Some("dc1")
                    && !query.cursor.is_set())
        );
    }

    #[tokio::test]
    async fn reconcile_all_catalog_failure() {
        let fixture = fixture(&[("api", API_ARN)], FakeBalancer::healthy(&[("10.0.0.1", 80)]));
        fixture.catalog.push_err();

        let outcomes = fixture.app.reconcile_all(Some("dc2")).await.unwrap();
        match &outcomes[0].1 {
            Err(err @ Error::Catalog { .. }) => assert_eq!(err.exit_code(), exitcode::UNAVAILABLE),
            other => panic!("unexpected outcome {other:?}"),
        }

        // a failed query is never an empty catalog
        assert!(fixture.balancer.calls().is_empty());
        assert_eq!(
            fixture.catalog.queries()[0].datacenter.as_deref(),
            Some("dc2")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_one_waits_settle_delay() {
        let fixture = fixture(&[("api", API_ARN)], FakeBalancer::healthy(&[("10.0.0.9", 80)]));
        fixture.catalog.push_ok(3, &[("10.0.0.1", 80)]);

        let start = tokio::time::Instant::now();
        let applied = fixture
            .app
            .reconcile_one("api", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(60));

        assert_eq!(applied.added, targets(&[("10.0.0.1", 80)]));
        assert_eq!(applied.removed, targets(&[("10.0.0.9", 80)]));
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_one_skips_unknown_service() {
        let fixture = fixture(&[("api", API_ARN)], FakeBalancer::default());

        let start = tokio::time::Instant::now();
        assert!(fixture.app.reconcile_one("web", None).await.unwrap().is_none());
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(fixture.catalog.queries().is_empty());
    }

    #[tokio::test]
    async fn watch_forever_until_cancelled() {
        let fixture = fixture(&[("api", API_ARN)], FakeBalancer::healthy(&[]));
        fixture.catalog.push_ok(3, &[("10.0.0.1", 80)]);
        fixture.catalog.push_ok(4, &[("10.0.0.2", 80)]);

        let (trigger, tripwire) = Tripwire::new("api");
        let handle = tokio::spawn({
            let app = Arc::clone(&fixture.app);
            async move { app.watch_forever("api", None, tripwire).await }
        });

        while fixture.balancer.registered() != targets(&[("10.0.0.2", 80)]) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        trigger.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(
            fixture.balancer.writes(),
            vec![
                Call::Register(targets(&[("10.0.0.1", 80)])),
                Call::Register(targets(&[("10.0.0.2", 80)])),
                Call::Deregister(targets(&[("10.0.0.1", 80)])),
            ]
        );
    }

    #[tokio::test]
    async fn watch_forever_without_target_group() {
        let fixture = fixture(&[], FakeBalancer::default());

        fixture
            .app
            .watch_forever("api", None, Tripwire::never())
            .await
            .unwrap();
        assert!(fixture.catalog.queries().is_empty());
        assert_eq!(fixture.balancer.registered(), TargetSet::new());
    }
}
