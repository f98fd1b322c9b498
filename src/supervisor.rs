use std::collections::BTreeMap;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use tripwire::{Trigger, Tripwire};

struct Task {
    trigger: Trigger,
    handle: JoinHandle<()>,
}

async fn join(service: &str, handle: JoinHandle<()>) {
    if let Err(err) = handle.await {
        error!(message = "watch task failed", service, %err);
    }
}

/// Keeps one watch task per service, each with its own tripwire.
#[derive(Default)]
pub struct Supervisor {
    tasks: BTreeMap<String, Task>,
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor::default()
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn the task built by `f` for `service`, unless one is running
    /// already. Returns whether a task was spawned.
    pub fn start<F, Fut>(&mut self, service: &str, f: F) -> bool
    where
        F: FnOnce(Tripwire) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.tasks.contains_key(service) {
            return false;
        }

        let (trigger, tripwire) = Tripwire::new(service);
        let handle = tokio::spawn(f(tripwire));
        self.tasks
            .insert(service.to_string(), Task { trigger, handle });

        info!(message = "watch task started", service);

        true
    }

    /// Cancel the task of `service` and wait for it to finish.
    pub async fn stop(&mut self, service: &str) -> bool {
        match self.tasks.remove(service) {
            Some(task) => {
                task.trigger.cancel();
                join(service, task.handle).await;
                info!(message = "watch task stopped", service);
                true
            }
            None => false,
        }
    }

    /// Stop every task whose service is not in `services`.
    pub async fn retain(&mut self, services: &[String]) {
        let removed = self
            .tasks
            .keys()
            .filter(|service| !services.contains(service))
            .cloned()
            .collect::<Vec<_>>();

        for service in removed {
            self.stop(&service).await;
        }
    }

    /// Forget tasks that ended on their own, so they can be started again.
    pub fn reap(&mut self) -> Vec<String> {
        let finished = self
            .tasks
            .iter()
            .filter(|(_, task)| task.handle.is_finished())
            .map(|(service, _)| service.clone())
            .collect::<Vec<_>>();

        for service in &finished {
            if let Some(task) = self.tasks.remove(service) {
                // nothing is waiting on a finished task
                task.trigger.disarm();
            }
            debug!(message = "reaped finished watch task", service);
        }

        finished
    }

    /// Cancel every task, then wait for all of them.
    pub async fn shutdown(&mut self) {
        let handles = std::mem::take(&mut self.tasks)
            .into_iter()
            .map(|(service, task)| {
                task.trigger.cancel();
                (service, task.handle)
            })
            .collect::<Vec<_>>();

        for (service, handle) in handles {
            join(&service, handle).await;
        }

        info!(message = "all watch tasks stopped");
    }
}
