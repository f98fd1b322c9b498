use std::pin::pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};
use tripwire::Tripwire;

use crate::balancer::{BalancerError, TargetGroup};
use crate::resolver::{IdentityError, InstanceLookup, TargetGroupBinding};
use crate::target::{Target, TargetSet};

/// The changes needed to turn `actual` into `desired`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub to_add: TargetSet,
    pub to_remove: TargetSet,
}

impl Plan {
    pub fn compute(desired: &TargetSet, actual: &TargetSet) -> Plan {
        let all = desired.union(actual);

        Plan {
            to_add: all.subtract(actual),
            to_remove: all.subtract(desired),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// What a successful pass changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Applied {
    pub added: TargetSet,
    pub removed: TargetSet,
}

impl Applied {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("read targets failed, {0}")]
    ReadTargets(BalancerError),
    #[error("register targets failed, {source}, skipped removal of {skipped_removal}")]
    Register {
        source: BalancerError,
        skipped_removal: TargetSet,
    },
    #[error("deregister targets failed, {source}, {added} were registered")]
    Deregister {
        source: BalancerError,
        added: TargetSet,
    },
    #[error(transparent)]
    ResolveIdentity(#[from] IdentityError),
}

/// Applies catalog snapshots to one target group.
///
/// Registration always goes first, and a failed registration skips the
/// removal of that pass, so a degraded environment never ends up with fewer
/// targets than either side reports.
pub struct Reconciler {
    service: String,
    target_group: TargetGroup,
    instances: Option<Arc<dyn InstanceLookup>>,
}

impl Reconciler {
    pub fn new(binding: &TargetGroupBinding) -> Self {
        Reconciler {
            service: binding.service.clone(),
            target_group: binding.target_group.clone(),
            instances: binding.instances.clone(),
        }
    }

    pub fn target_group(&self) -> &str {
        self.target_group.arn()
    }

    /// One pass, `desired` is the catalog's view of the service.
    pub async fn reconcile(&self, desired: &TargetSet) -> Result<Applied, ReconcileError> {
        let desired = match &self.instances {
            Some(instances) => identify(instances.as_ref(), desired).await?,
            None => desired.clone(),
        };

        // never guess the actual state, an empty set here would remove
        // every desired target
        let membership = self
            .target_group
            .membership()
            .await
            .map_err(ReconcileError::ReadTargets)?;

        // draining targets are left alone until the load balancer is done
        // with them
        let deferred = desired.iter().filter(|target| membership.draining.contains(target));
        for target in deferred {
            debug!(
                message = "defer draining target",
                service = self.service,
                target_group = self.target_group.arn(),
                %target
            );
        }
        let desired = desired.subtract(&membership.draining);

        let plan = Plan::compute(&desired, &membership.active);
        if plan.is_empty() {
            debug!(
                message = "target group in sync",
                service = self.service,
                target_group = self.target_group.arn(),
                targets = desired.len()
            );

            return Ok(Applied::default());
        }

        info!(
            message = "reconcile target group",
            service = self.service,
            target_group = self.target_group.arn(),
            to_add = %plan.to_add,
            to_remove = %plan.to_remove
        );

        if let Err(source) = self.target_group.add_targets(&plan.to_add).await {
            if !plan.to_remove.is_empty() {
                warn!(
                    message = "register failed, skip removal",
                    service = self.service,
                    target_group = self.target_group.arn(),
                    skipped = %plan.to_remove
                );
            }

            return Err(ReconcileError::Register {
                source,
                skipped_removal: plan.to_remove,
            });
        }

        if let Err(source) = self.target_group.remove_targets(&plan.to_remove).await {
            return Err(ReconcileError::Deregister {
                source,
                added: plan.to_add,
            });
        }

        Ok(Applied {
            added: plan.to_add,
            removed: plan.to_remove,
        })
    }

    /// Reconcile every snapshot of `snapshots` until it ends or `tripwire`
    /// fires. A failed pass is logged and the next snapshot retries it.
    pub async fn run<S>(&self, snapshots: S, mut tripwire: Tripwire)
    where
        S: Stream<Item = TargetSet>,
    {
        let mut snapshots = pin!(snapshots);

        debug!(
            message = "start reconcile loop",
            service = self.service,
            target_group = self.target_group.arn()
        );

        loop {
            let desired = tokio::select! {
                biased;

                _ = &mut tripwire => break,
                next = snapshots.next() => match next {
                    Some(desired) => desired,
                    None => break,
                },
            };

            tokio::select! {
                biased;

                _ = &mut tripwire => break,
                result = self.reconcile(&desired) => match result {
                    Ok(applied) => {
                        if !applied.is_empty() {
                            info!(
                                message = "target group reconciled",
                                service = self.service,
                                target_group = self.target_group.arn(),
                                added = applied.added.len(),
                                removed = applied.removed.len()
                            );
                        }
                    }
                    Err(err) => {
                        warn!(
                            message = "reconcile target group failed",
                            service = self.service,
                            target_group = self.target_group.arn(),
                            %err
                        );
                    }
                }
            }
        }

        debug!(
            message = "reconcile loop stopped",
            service = self.service,
            target_group = self.target_group.arn()
        );
    }
}

async fn identify(
    instances: &dyn InstanceLookup,
    desired: &TargetSet,
) -> Result<TargetSet, IdentityError> {
    let mut identified = TargetSet::new();
    for target in desired {
        let id = instances.instance_id(&target.id).await?;
        identified.insert(Target::new(id, target.port));
    }

    Ok(identified)
}
