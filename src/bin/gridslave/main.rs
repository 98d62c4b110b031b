mod args;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use futures::future::join_all;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::args::Args;
use peergrid::config::{verbose_level, ConfigFile, Settings};
use peergrid::engine::ProcessEngine;
use peergrid::intake::{self, IntakeLimits};
use peergrid::presence;
use peergrid::registry::Registry;
use peergrid::slave::{Slave, SlaveTimeouts, ZOMBIE_TIMEOUT};
use peergrid::supervisor::{ChildSpec, Supervisor};
use peergrid::types::host::HostDescriptor;
use peergrid::types::policy::{AccessLists, SmartPolicies};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let settings = args.settings();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(verbose_level(settings.verbose))
            .init();
    } else {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(verbose_level(settings.verbose))
            .init();
    }

    // Cancellation on ctrl-c; threads die with the process, so there is no
    // graceful drain beyond this.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    match args.worker_id {
        Some(id) => run_worker(id, settings, cancel).await,
        None => run_supervisor(&args, settings, cancel).await,
    }
}

/// Parent mode: expand the configuration into worker specs and keep them
/// alive until interrupted.
async fn run_supervisor(args: &Args, base: Settings, cancel: CancellationToken) -> ExitCode {
    let workers = match &args.config {
        Some(path) => match ConfigFile::load(path) {
            Ok(file) => file.workers(&base),
            Err(error) => {
                error!(%error, "bad configuration");
                return ExitCode::from(2);
            },
        },
        None => vec![base.clone(); base.number.max(1)],
    };

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(error) => {
            error!(%error, "cannot locate own executable");
            return ExitCode::FAILURE;
        },
    };

    // Ids are seeded from the boot time so they stay unique across
    // supervisor restarts and strictly increase within one.
    let base_id = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let specs = workers
        .iter()
        .map(|settings| {
            let mut args_v = settings.to_worker_args();
            if args.debug {
                args_v.push("--debug".into());
            }
            ChildSpec {
                program: exe.clone(),
                args: args_v,
            }
        })
        .collect::<Vec<_>>();

    info!(workers = specs.len(), "supervising");

    match Supervisor::new(specs, base_id).run(cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "supervisor failed");
            ExitCode::FAILURE
        },
    }
}

/// Worker mode: one registry, the intake/presence tasks, and the slave loop
/// on this task until it finishes or is cancelled.
async fn run_worker(id: u64, settings: Settings, cancel: CancellationToken) -> ExitCode {
    let host = HostDescriptor {
        id,
        name: settings.hostname.clone(),
        user: settings.user.clone(),
        group: settings.group.clone(),
        memavail: settings.memavail,
        cpuavail: settings.cpuavail,
        timavail: settings.timavail,
        ..Default::default()
    };

    let registry = Arc::new(Registry::new(
        host,
        AccessLists::from_lists(&settings.allowuser, &settings.allowhost, &settings.allowgroup),
        SmartPolicies::from_flags(settings.smartmem, settings.smartcpu, settings.smartshare),
    ));

    match serve(id, &settings, registry, cancel).await {
        Ok(false) => ExitCode::SUCCESS,
        Ok(true) => {
            // the supervisor reads this as "engine aborted; respawn me"
            ExitCode::from(1)
        },
        Err(error) => {
            error!(%error, "failed to start worker");
            ExitCode::from(111)
        },
    }
}

async fn serve(
    id: u64,
    settings: &Settings,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) -> Result<bool> {
    let limits = IntakeLimits {
        max_job_size: settings.max_job_size,
    };

    let tcp = intake::bind_tcp(&registry, settings.port).await?;

    #[cfg(unix)]
    let socket_path = settings.socket_path(id);
    #[cfg(unix)]
    let uds = intake::bind_uds(&registry, &socket_path)?;

    let announce_dest = SocketAddr::new(settings.announce_addr, settings.announce_port);
    let announce_sock = presence::bind_announce()?;
    let discover_sock = presence::bind_discover(announce_dest)?;
    let (announce, kicks) = presence::announce_channel();

    let mut tasks = Vec::new();

    {
        let registry = registry.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(error) = intake::run_tcp(registry, tcp, limits, cancel).await {
                error!(%error, "job intake failed");
            }
        }));
    }

    #[cfg(unix)]
    {
        let registry = registry.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(error) = intake::run_uds(registry, uds, limits, cancel).await {
                error!(%error, "local job intake failed");
            }
        }));
    }

    tasks.push(tokio::spawn(presence::run_announce(
        registry.clone(),
        announce_sock,
        vec![announce_dest],
        kicks,
        presence::ANNOUNCE_PERIOD,
        cancel.clone(),
    )));
    tasks.push(tokio::spawn(presence::run_discover(
        registry.clone(),
        discover_sock,
        cancel.clone(),
    )));
    tasks.push(tokio::spawn(presence::run_expire(
        registry.clone(),
        presence::SWEEP_PERIOD,
        presence::PEER_EXPIRY,
        cancel.clone(),
    )));

    info!(id, name = %settings.hostname, "worker up");

    let mut slave = Slave::new(
        registry,
        announce,
        ProcessEngine::new(),
        settings.matlab.clone(),
        SlaveTimeouts {
            engine_idle: Duration::from_secs(settings.timeout),
            zombie: ZOMBIE_TIMEOUT,
        },
    );
    let aborted = slave.run(&cancel).await;

    cancel.cancel();
    join_all(tasks).await;

    #[cfg(unix)]
    let _ = std::fs::remove_file(&socket_path);

    Ok(aborted)
}
