use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_elasticloadbalancingv2::Client;
use aws_sdk_elasticloadbalancingv2::error::DisplayErrorContext;
use aws_sdk_elasticloadbalancingv2::types::{TargetDescription, TargetHealthDescription};
use tracing::{debug, info, warn};

use crate::target::{Target, TargetSet};

/// Health of a registered target, as reported by the load balancer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetHealthState {
    Initial,
    Healthy,
    Unhealthy,
    Unused,
    Draining,
    Unavailable,
    Unknown(String),
}

impl From<&str> for TargetHealthState {
    fn from(value: &str) -> Self {
        match value {
            "initial" => TargetHealthState::Initial,
            "healthy" => TargetHealthState::Healthy,
            "unhealthy" => TargetHealthState::Unhealthy,
            "unused" => TargetHealthState::Unused,
            "draining" => TargetHealthState::Draining,
            "unavailable" => TargetHealthState::Unavailable,
            other => TargetHealthState::Unknown(other.to_string()),
        }
    }
}

impl Display for TargetHealthState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TargetHealthState::Initial => "initial",
            TargetHealthState::Healthy => "healthy",
            TargetHealthState::Unhealthy => "unhealthy",
            TargetHealthState::Unused => "unused",
            TargetHealthState::Draining => "draining",
            TargetHealthState::Unavailable => "unavailable",
            TargetHealthState::Unknown(s) => s.as_str(),
        };

        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetHealth {
    pub target: Target,
    pub state: TargetHealthState,
}

#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("{operation} failed, {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
    #[error("invalid target {target}, {message}")]
    InvalidTarget { target: Target, message: String },
}

/// Membership and health of load balancer target groups.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    async fn describe_target_health(
        &self,
        target_group: &str,
    ) -> Result<Vec<TargetHealth>, BalancerError>;

    async fn register_targets(
        &self,
        target_group: &str,
        targets: &TargetSet,
    ) -> Result<(), BalancerError>;

    async fn deregister_targets(
        &self,
        target_group: &str,
        targets: &TargetSet,
    ) -> Result<(), BalancerError>;
}

/// ELBv2 backed implementation.
#[derive(Clone, Debug)]
pub struct ElbClient {
    client: Client,
}

impl ElbClient {
    pub fn new(client: Client) -> Self {
        ElbClient { client }
    }
}

fn descriptions(targets: &TargetSet) -> Result<Vec<TargetDescription>, BalancerError> {
    targets
        .iter()
        .map(|target| {
            TargetDescription::builder()
                .id(target.id.as_str())
                .port(i32::from(target.port))
                .build()
                .map_err(|err| BalancerError::InvalidTarget {
                    target: target.clone(),
                    message: err.to_string(),
                })
        })
        .collect()
}

/// Targets without a port, e.g. lambda functions, have no `Target`
/// counterpart, so they are never part of the actual set and never
/// deregistered.
fn target_health(
    target_group: &str,
    description: &TargetHealthDescription,
) -> Option<TargetHealth> {
    let target = description.target()?;
    let Some(port) = target.port().and_then(|port| u16::try_from(port).ok()) else {
        warn!(
            message = "ignore registered target without a valid port",
            target_group,
            id = target.id(),
            port = target.port()
        );

        return None;
    };

    let state = description
        .target_health()
        .and_then(|health| health.state())
        .map(|state| TargetHealthState::from(state.as_str()))
        .unwrap_or_else(|| TargetHealthState::Unknown(String::new()));

    Some(TargetHealth {
        target: Target::new(target.id(), port),
        state,
    })
}

#[async_trait]
impl LoadBalancer for ElbClient {
    async fn describe_target_health(
        &self,
        target_group: &str,
    ) -> Result<Vec<TargetHealth>, BalancerError> {
        let output = self
            .client
            .describe_target_health()
            .target_group_arn(target_group)
            .send()
            .await
            .map_err(|err| BalancerError::Api {
                operation: "DescribeTargetHealth",
                message: DisplayErrorContext(err).to_string(),
            })?;

        let healths = output
            .target_health_descriptions()
            .iter()
            .filter_map(|description| target_health(target_group, description))
            .collect();

        Ok(healths)
    }

    async fn register_targets(
        &self,
        target_group: &str,
        targets: &TargetSet,
    ) -> Result<(), BalancerError> {
        self.client
            .register_targets()
            .target_group_arn(target_group)
            .set_targets(Some(descriptions(targets)?))
            .send()
            .await
            .map_err(|err| BalancerError::Api {
                operation: "RegisterTargets",
                message: DisplayErrorContext(err).to_string(),
            })?;

        Ok(())
    }

    async fn deregister_targets(
        &self,
        target_group: &str,
        targets: &TargetSet,
    ) -> Result<(), BalancerError> {
        self.client
            .deregister_targets()
            .target_group_arn(target_group)
            .set_targets(Some(descriptions(targets)?))
            .send()
            .await
            .map_err(|err| BalancerError::Api {
                operation: "DeregisterTargets",
                message: DisplayErrorContext(err).to_string(),
            })?;

        Ok(())
    }
}

/// Targets registered to a group. Draining targets are on their way out
/// already, they are not part of `active`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Membership {
    pub active: TargetSet,
    pub draining: TargetSet,
}

/// One target group, seen as a set of targets.
#[derive(Clone)]
pub struct TargetGroup {
    arn: String,
    client: Arc<dyn LoadBalancer>,
}

impl TargetGroup {
    pub fn new(arn: impl Into<String>, client: Arc<dyn LoadBalancer>) -> Self {
        TargetGroup {
            arn: arn.into(),
            client,
        }
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    /// Registered targets, split by whether they are draining.
    pub async fn membership(&self) -> Result<Membership, BalancerError> {
        let healths = self.client.describe_target_health(&self.arn).await?;

        let mut membership = Membership::default();
        for health in healths {
            if health.state == TargetHealthState::Draining {
                debug!(
                    message = "found draining target",
                    target_group = self.arn,
                    target = %health.target
                );

                membership.draining.insert(health.target);
            } else {
                membership.active.insert(health.target);
            }
        }

        Ok(membership)
    }

    /// Registered targets, except the draining ones.
    pub async fn current_targets(&self) -> Result<TargetSet, BalancerError> {
        self.membership().await.map(|membership| membership.active)
    }

    pub async fn add_targets(&self, targets: &TargetSet) -> Result<(), BalancerError> {
        if targets.is_empty() {
            return Ok(());
        }

        self.client.register_targets(&self.arn, targets).await?;

        info!(
            message = "targets registered",
            target_group = self.arn,
            %targets
        );

        Ok(())
    }

    pub async fn remove_targets(&self, targets: &TargetSet) -> Result<(), BalancerError> {
        if targets.is_empty() {
            return Ok(());
        }

        self.client.deregister_targets(&self.arn, targets).await?;

        info!(
            message = "targets deregistered",
            target_group = self.arn,
            %targets
        );

        Ok(())
    }
}
