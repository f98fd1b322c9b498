use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::retry::RetryConfig;
use aws_sdk_ec2::types::Filter;
use aws_sdk_elasticloadbalancingv2::config::{Credentials, Region};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::balancer::{ElbClient, LoadBalancer, TargetGroup};

fn default_prefix() -> String {
    "service/apps/targetgroups/".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ArnError {
    #[error("expect at least 6 colon separated fields, got {0}")]
    TooFewFields(usize),
    #[error("missing \"arn\" prefix")]
    NotArn,
    #[error("resource {0:?} is not a target group")]
    NotTargetGroup(String),
    #[error("empty region")]
    EmptyRegion,
}

/// `arn:<partition>:elasticloadbalancing:<region>:<account>:targetgroup/<name>/<id>`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetGroupArn {
    arn: String,
    region: String,
}

impl TargetGroupArn {
    pub fn parse(input: &str) -> Result<Self, ArnError> {
        let input = input.trim();
        let parts = input.splitn(6, ':').collect::<Vec<_>>();
        if parts.len() < 6 {
            return Err(ArnError::TooFewFields(parts.len()));
        }

        if parts[0] != "arn" {
            return Err(ArnError::NotArn);
        }

        if !parts[5].starts_with("targetgroup/") {
            return Err(ArnError::NotTargetGroup(parts[5].to_string()));
        }

        let region = parts[3];
        if region.is_empty() {
            return Err(ArnError::EmptyRegion);
        }

        Ok(TargetGroupArn {
            arn: input.to_string(),
            region: region.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.arn
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// The name part of the resource, e.g. `api` for `targetgroup/api/73e2d6bc24d8a067`
    pub fn name(&self) -> &str {
        self.arn
            .rsplit(':')
            .next()
            .and_then(|resource| resource.split('/').nth(1))
            .unwrap_or_default()
    }
}

impl Display for TargetGroupArn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.arn)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Consul(#[from] consul::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("DescribeInstances failed, {0}")]
    Api(String),
    #[error("no instance owns address {0}")]
    NotFound(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("lookup target group of service {service} failed, {source}")]
    Lookup { service: String, source: StoreError },
    #[error("list target groups failed, {0}")]
    List(StoreError),
    #[error("invalid target group {arn:?} of service {service}, {source}")]
    InvalidArn {
        service: String,
        arn: String,
        source: ArnError,
    },
    #[error("resolve credentials of region {region} failed, {message}")]
    Credentials { region: String, message: String },
}

/// Where the target group of a service is configured.
#[async_trait]
pub trait TargetGroupStore: Send + Sync {
    /// The target group arn of `service`, `None` if there is none.
    async fn lookup(&self, service: &str) -> Result<Option<String>, StoreError>;

    /// Every configured `(service, arn)` pair.
    async fn list(&self) -> Result<Vec<(String, String)>, StoreError>;
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TargetGroupsConfig {
    /// KV prefix the arns are stored under, one key per service.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for TargetGroupsConfig {
    fn default() -> Self {
        TargetGroupsConfig {
            prefix: default_prefix(),
        }
    }
}

/// Target groups stored in Consul KV, at `<prefix><service>`.
pub struct ConsulTargetGroups {
    client: consul::Client,
    prefix: String,
}

impl ConsulTargetGroups {
    pub fn new(client: consul::Client, config: &TargetGroupsConfig) -> Self {
        let mut prefix = config.prefix.trim_start_matches('/').to_string();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        ConsulTargetGroups { client, prefix }
    }
}

fn service_name<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|name| !name.is_empty())
}

#[async_trait]
impl TargetGroupStore for ConsulTargetGroups {
    async fn lookup(&self, service: &str) -> Result<Option<String>, StoreError> {
        let key = format!("{}{}", self.prefix, service);
        let arn = self
            .client
            .kv_get(&key)
            .await?
            .map(|pair| pair.value_str())
            .filter(|value| !value.is_empty());

        Ok(arn)
    }

    async fn list(&self) -> Result<Vec<(String, String)>, StoreError> {
        let pairs = self.client.kv_list(&self.prefix).await?;

        Ok(pairs
            .iter()
            .filter_map(|pair| {
                let service = service_name(&self.prefix, &pair.key)?;
                let arn = pair.value_str();
                if arn.is_empty() {
                    debug!(message = "skip service without target group", service);
                    return None;
                }

                Some((service.to_string(), arn))
            })
            .collect())
    }
}

/// A static AWS access key.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AccessKey {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

impl Debug for AccessKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessKey")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"**REDACTED**")
            .finish()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AwsConfig {
    /// Used for every region without its own key. The default credential
    /// provider chain (env, profile, IMDS) is used when absent.
    #[serde(default)]
    pub credentials: Option<AccessKey>,

    /// Per region keys, e.g. `us-east-1`
    #[serde(default)]
    pub regions: BTreeMap<String, AccessKey>,
}

/// Hands out the credentials for a region.
#[async_trait]
pub trait ResolveCredentials: Send + Sync {
    /// `None` means the default credential provider chain should be used.
    async fn resolve(&self, region: &str) -> Result<Option<AccessKey>, ResolveError>;
}

pub struct StaticCredentials {
    default: Option<AccessKey>,
    regions: BTreeMap<String, AccessKey>,
}

impl StaticCredentials {
    pub fn new(config: &AwsConfig) -> Self {
        StaticCredentials {
            default: config.credentials.clone(),
            regions: config.regions.clone(),
        }
    }
}

#[async_trait]
impl ResolveCredentials for StaticCredentials {
    async fn resolve(&self, region: &str) -> Result<Option<AccessKey>, ResolveError> {
        let Some(key) = self.regions.get(region).or(self.default.as_ref()) else {
            return Ok(None);
        };

        let missing = if key.access_key_id.is_empty() {
            "access_key_id"
        } else if key.secret_access_key.is_empty() {
            "secret_access_key"
        } else {
            return Ok(Some(key.clone()));
        };

        Err(ResolveError::Credentials {
            region: region.to_string(),
            message: format!("{missing} is empty"),
        })
    }
}

/// Maps the private address of an instance to its instance id.
#[async_trait]
pub trait InstanceLookup: Send + Sync {
    async fn instance_id(&self, address: &str) -> Result<String, IdentityError>;
}

pub struct Ec2Instances {
    client: aws_sdk_ec2::Client,
}

impl Ec2Instances {
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Ec2Instances { client }
    }
}

#[async_trait]
impl InstanceLookup for Ec2Instances {
    async fn instance_id(&self, address: &str) -> Result<String, IdentityError> {
        let output = self
            .client
            .describe_instances()
            .filters(
                Filter::builder()
                    .name("private-ip-address")
                    .values(address)
                    .build(),
            )
            .send()
            .await
            .map_err(|err| {
                IdentityError::Api(aws_sdk_ec2::error::DisplayErrorContext(err).to_string())
            })?;

        output
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances())
            .find_map(|instance| instance.instance_id())
            .map(ToString::to_string)
            .ok_or_else(|| IdentityError::NotFound(address.to_string()))
    }
}

/// Region scoped clients of one binding.
#[derive(Clone)]
pub struct RegionClients {
    pub balancer: Arc<dyn LoadBalancer>,
    pub instances: Arc<dyn InstanceLookup>,
}

#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn build(&self, region: &str) -> Result<RegionClients, ResolveError>;
}

/// Builds SDK clients for a region. SDK retries are disabled, a failed call
/// is retried by the next reconciliation pass.
pub struct AwsClientFactory {
    credentials: Arc<dyn ResolveCredentials>,
}

impl AwsClientFactory {
    pub fn new(credentials: Arc<dyn ResolveCredentials>) -> Self {
        AwsClientFactory { credentials }
    }
}

#[async_trait]
impl ClientFactory for AwsClientFactory {
    async fn build(&self, region: &str) -> Result<RegionClients, ResolveError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .retry_config(RetryConfig::disabled());

        match self.credentials.resolve(region).await? {
            Some(key) => {
                debug!(
                    message = "use static credentials",
                    region,
                    access_key_id = key.access_key_id
                );

                loader = loader.credentials_provider(Credentials::new(
                    key.access_key_id,
                    key.secret_access_key,
                    key.session_token,
                    None,
                    "squirrel",
                ));
            }
            None => {
                debug!(message = "use default credential provider chain", region);
            }
        }

        let sdk_config = loader.load().await;

        Ok(RegionClients {
            balancer: Arc::new(ElbClient::new(
                aws_sdk_elasticloadbalancingv2::Client::new(&sdk_config),
            )),
            instances: Arc::new(Ec2Instances::new(aws_sdk_ec2::Client::new(&sdk_config))),
        })
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    /// Translate catalog addresses into EC2 instance ids before registering
    /// them. When disabled the catalog address is the target id, which
    /// requires target groups of type `ip`.
    #[serde(default)]
    pub resolve_instance_ids: bool,
}

/// Everything needed to reconcile the target group of one service.
#[derive(Clone)]
pub struct TargetGroupBinding {
    pub service: String,
    pub datacenter: Option<String>,
    pub arn: TargetGroupArn,
    pub target_group: TargetGroup,
    /// Set only when instance id resolution is enabled
    pub instances: Option<Arc<dyn InstanceLookup>>,
}

impl Debug for TargetGroupBinding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetGroupBinding")
            .field("service", &self.service)
            .field("datacenter", &self.datacenter)
            .field("arn", &self.arn)
            .field("resolve_instance_ids", &self.instances.is_some())
            .finish()
    }
}

pub struct Resolver {
    store: Arc<dyn TargetGroupStore>,
    factory: Arc<dyn ClientFactory>,
    resolve_instance_ids: bool,
}

impl Resolver {
    pub fn new(
        store: Arc<dyn TargetGroupStore>,
        factory: Arc<dyn ClientFactory>,
        identity: &IdentityConfig,
    ) -> Self {
        Resolver {
            store,
            factory,
            resolve_instance_ids: identity.resolve_instance_ids,
        }
    }

    /// Every service with a configured target group.
    pub async fn services(&self) -> Result<Vec<(String, String)>, ResolveError> {
        self.store.list().await.map_err(ResolveError::List)
    }

    /// The binding of `service`, `None` if no target group is configured for
    /// it.
    pub async fn resolve(
        &self,
        service: &str,
        datacenter: Option<&str>,
    ) -> Result<Option<TargetGroupBinding>, ResolveError> {
        let arn = self
            .store
            .lookup(service)
            .await
            .map_err(|source| ResolveError::Lookup {
                service: service.to_string(),
                source,
            })?;

        match arn {
            Some(arn) => self.bind(service, &arn, datacenter).await.map(Some),
            None => {
                warn!(message = "no target group configured", service);
                Ok(None)
            }
        }
    }

    /// Build the binding of `service` to an already known arn.
    pub async fn bind(
        &self,
        service: &str,
        arn: &str,
        datacenter: Option<&str>,
    ) -> Result<TargetGroupBinding, ResolveError> {
        let arn = TargetGroupArn::parse(arn).map_err(|source| ResolveError::InvalidArn {
            service: service.to_string(),
            arn: arn.to_string(),
            source,
        })?;

        let clients = self.factory.build(arn.region()).await?;

        info!(
            message = "target group resolved",
            service,
            target_group = arn.as_str(),
            name = arn.name(),
            region = arn.region()
        );

        Ok(TargetGroupBinding {
            service: service.to_string(),
            datacenter: datacenter.map(ToString::to_string),
            target_group: TargetGroup::new(arn.as_str(), clients.balancer),
            instances: self.resolve_instance_ids.then_some(clients.instances),
            arn,
        })
    }
}
