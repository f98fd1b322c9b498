use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use argh::FromArgs;
use exitcode::ExitCode;
use futures::StreamExt;
use squirrel::app::App;
use squirrel::config::{Config, DEFAULT_CONFIG_PATH};
use squirrel::signal::{self, SignalTo};
use squirrel::supervisor::Supervisor;
use tracing::{error, info, warn};

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(2)
}

fn default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

#[derive(FromArgs)]
#[argh(
    description = "Squirrel keeps AWS target groups in sync with the healthy instances of Consul services",
    help_triggers("-h", "--help")
)]
pub struct RootCommand {
    #[argh(switch, short = 'v', description = "show version")]
    version: bool,

    #[argh(
        option,
        short = 'l',
        default = "\"info\".to_string()",
        description = "log level, SQUIRREL_LOG takes precedence"
    )]
    log_level: String,

    #[argh(
        option,
        short = 'c',
        long = "config",
        default = "default_config_path()",
        description = "read configuration from this file"
    )]
    config: PathBuf,

    #[argh(
        option,
        short = 't',
        default = "default_worker_threads()",
        description = "specify how many threads the Tokio runtime will use"
    )]
    threads: usize,

    #[argh(subcommand)]
    sub_commands: Option<SubCommands>,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum SubCommands {
    Sync(Sync),
    SyncService(SyncService),
    Watch(Watch),
}

#[derive(FromArgs)]
#[argh(
    subcommand,
    name = "sync",
    description = "Reconcile every configured target group once",
    help_triggers("-h", "--help")
)]
struct Sync {
    #[argh(option, short = 'd', description = "datacenter to query")]
    datacenter: Option<String>,
}

#[derive(FromArgs)]
#[argh(
    subcommand,
    name = "sync-service",
    description = "Reconcile the target group of one service once, e.g. after it was deployed",
    help_triggers("-h", "--help")
)]
struct SyncService {
    #[argh(positional, description = "service name")]
    service: String,

    #[argh(option, short = 'd', description = "datacenter to query")]
    datacenter: Option<String>,
}

#[derive(FromArgs)]
#[argh(
    subcommand,
    name = "watch",
    description = "Keep target groups in sync until terminated",
    help_triggers("-h", "--help")
)]
struct Watch {
    #[argh(
        positional,
        description = "services to watch, every configured target group if omitted"
    )]
    services: Vec<String>,

    #[argh(option, short = 'd', description = "datacenter to query")]
    datacenter: Option<String>,
}

impl RootCommand {
    #![allow(clippy::print_stdout)]
    fn show_version(&self) {
        println!("Squirrel {}", env!("CARGO_PKG_VERSION"));
    }

    pub fn run(self) -> Result<(), ExitCode> {
        if self.version {
            self.show_version();
            return Ok(());
        }

        let Some(command) = self.sub_commands else {
            #[allow(clippy::print_stderr)]
            {
                eprintln!("No subcommand given, see --help for the available ones");
            }

            return Err(exitcode::USAGE);
        };

        let log_level = std::env::var("SQUIRREL_LOG").unwrap_or(self.log_level);
        let color = std::io::stdout().is_terminal();
        squirrel::trace::init(color, &log_level);

        let config = Config::load(&self.config).map_err(|err| {
            error!(message = "load config failed", %err);
            exitcode::CONFIG
        })?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("squirrel-worker")
            .worker_threads(self.threads)
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| {
                error!(message = "build runtime failed", %err);
                exitcode::OSERR
            })?;

        info!(
            message = "Start squirrel",
            version = env!("CARGO_PKG_VERSION"),
            threads = self.threads,
            config = ?self.config
        );

        let config_path = self.config;
        let result = runtime.block_on(async move {
            match command {
                SubCommands::Sync(cmd) => sync(&config, cmd.datacenter.as_deref()).await,
                SubCommands::SyncService(cmd) => {
                    sync_service(&config, &cmd.service, cmd.datacenter.as_deref()).await
                }
                SubCommands::Watch(cmd) => {
                    watch(config_path, config, cmd.services, cmd.datacenter).await
                }
            }
        });

        runtime.shutdown_timeout(Duration::from_secs(5));

        result
    }
}

fn build_app(config: &Config) -> Result<App, ExitCode> {
    App::new(config).map_err(|err| {
        error!(message = "build app failed", %err);
        err.exit_code()
    })
}

async fn sync(config: &Config, datacenter: Option<&str>) -> Result<(), ExitCode> {
    let app = build_app(config)?;

    let outcomes = app.reconcile_all(datacenter).await.map_err(|err| {
        error!(message = "list target groups failed", %err);
        err.exit_code()
    })?;

    let mut code = exitcode::OK;
    for (service, result) in outcomes {
        match result {
            Ok(applied) => {
                info!(
                    message = "target group reconciled",
                    service,
                    added = applied.added.len(),
                    removed = applied.removed.len()
                );
            }
            // already logged by reconcile_all
            Err(err) => {
                if code != exitcode::CONFIG {
                    code = err.exit_code();
                }
            }
        }
    }

    if code == exitcode::OK {
        Ok(())
    } else {
        Err(code)
    }
}

async fn sync_service(
    config: &Config,
    service: &str,
    datacenter: Option<&str>,
) -> Result<(), ExitCode> {
    let app = build_app(config)?;

    match app.reconcile_one(service, datacenter).await {
        Ok(Some(applied)) => {
            info!(
                message = "target group reconciled",
                service,
                added = %applied.added,
                removed = %applied.removed
            );

            Ok(())
        }
        Ok(None) => {
            info!(message = "no target group configured, skipped", service);
            Ok(())
        }
        Err(err) => {
            error!(message = "reconcile failed", service, %err);
            Err(err.exit_code())
        }
    }
}

/// State of the `watch` command, reloaded on SIGHUP.
struct Watching {
    app: Arc<App>,
    config: Config,
    services: Vec<String>,
    datacenter: Option<String>,
    target_groups: BTreeMap<String, String>,
    supervisor: Supervisor,
}

impl Watching {
    /// The configured target groups, restricted to the requested services.
    async fn desired(&self) -> Result<BTreeMap<String, String>, squirrel::app::Error> {
        let target_groups = self
            .app
            .target_groups()
            .await?
            .into_iter()
            .filter(|(service, _)| self.services.is_empty() || self.services.contains(service))
            .collect::<BTreeMap<_, _>>();

        for service in &self.services {
            if !target_groups.contains_key(service) {
                warn!(message = "no target group configured", service);
            }
        }

        Ok(target_groups)
    }

    /// Start, stop and restart watch tasks until they match `desired`.
    async fn apply(&mut self, desired: BTreeMap<String, String>) {
        for service in self.supervisor.reap() {
            warn!(message = "watch task ended unexpectedly, restart it", service);
        }

        // the target group of a service changed
        for (service, arn) in &self.target_groups {
            if desired.get(service).is_some_and(|new| new != arn) {
                self.supervisor.stop(service).await;
            }
        }

        self.supervisor
            .retain(&desired.keys().cloned().collect::<Vec<_>>())
            .await;

        for service in desired.keys() {
            let app = Arc::clone(&self.app);
            let datacenter = self.datacenter.clone();
            let name = service.clone();

            self.supervisor.start(service, move |tripwire| async move {
                if let Err(err) = app
                    .watch_forever(&name, datacenter.as_deref(), tripwire)
                    .await
                {
                    error!(message = "watch target group failed", service = name, %err);
                }
            });
        }

        self.target_groups = desired;
    }

    async fn reload(&mut self, path: &PathBuf) {
        let config = match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                warn!(message = "Reload config failed, keep the running one", %err);
                return;
            }
        };

        let changed = match (
            serde_yaml::to_string(&self.config),
            serde_yaml::to_string(&config),
        ) {
            (Ok(old), Ok(new)) => old != new,
            _ => true,
        };

        if changed {
            let app = match App::new(&config) {
                Ok(app) => app,
                Err(err) => {
                    warn!(message = "Reload config failed, keep the running one", %err);
                    return;
                }
            };

            info!(message = "Config changed, restart every watch task");

            self.supervisor.shutdown().await;
            self.target_groups.clear();
            self.app = Arc::new(app);
            self.config = config;
        }

        match self.desired().await {
            Ok(desired) => {
                self.apply(desired).await;
                info!(
                    message = "Reload config successes",
                    watching = self.supervisor.len()
                );
            }
            Err(err) => {
                warn!(message = "List target groups failed, keep watching", %err);
            }
        }
    }
}

async fn watch(
    path: PathBuf,
    config: Config,
    services: Vec<String>,
    datacenter: Option<String>,
) -> Result<(), ExitCode> {
    let mut signals = signal::os_signals().map_err(|err| {
        error!(message = "set up signal handlers failed", %err);
        exitcode::OSERR
    })?;

    let mut watching = Watching {
        app: Arc::new(build_app(&config)?),
        config,
        services,
        datacenter,
        target_groups: BTreeMap::new(),
        supervisor: Supervisor::new(),
    };

    let desired = watching.desired().await.map_err(|err| {
        error!(message = "list target groups failed", %err);
        err.exit_code()
    })?;
    watching.apply(desired).await;

    info!(
        message = "Watching target groups",
        services = ?watching.supervisor.services().collect::<Vec<_>>()
    );

    loop {
        match signals.next().await {
            Some(SignalTo::ReloadFromDisk) => watching.reload(&path).await,
            Some(SignalTo::Shutdown) | None => {
                info!(message = "Shutdown signal received");

                tokio::select! {
                    // graceful shutdown finished
                    _ = watching.supervisor.shutdown() => (),
                    // a second signal skips waiting for the watch tasks
                    _ = signals.next() => (),
                }

                break;
            }
            Some(SignalTo::Quit) => {
                info!(message = "Quit signal received");
                break;
            }
        }
    }

    Ok(())
}
