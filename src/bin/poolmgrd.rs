//! PoolMgr daemon entry point
//!
//! Resolves the node's role, assembles the core context, runs the startup
//! sequencer, and parks in steady state while the pumps and periodic jobs
//! do the work.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use poolmgr::bootstrap::{self, StartupSequencer, TaskFlags};
use poolmgr::config::Config;
use poolmgr::db::persistence::{load_db_conf, DbLocation, Persistence};
use poolmgr::db::replication::ReplicationFeed;
use poolmgr::localdb::{keys, LocalDb};
use poolmgr::xenops::pumps;
use poolmgr::{Context, Database, EventBus, TaskManager};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/poolmgr/poolmgr.toml"));
    let config = if config_path.exists() {
        match Config::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("loading {}: {}", config_path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        log::info!("no configuration at {}, using defaults", config_path.display());
        Config::default()
    };

    let local = match LocalDb::open(&config.local_db_path) {
        Ok(local) => Arc::new(local),
        Err(e) => {
            log::error!("opening local store: {}", e);
            std::process::exit(1);
        }
    };
    let role = bootstrap::read_role(&local);
    log::info!("starting {} v{} as {:?}", poolmgr::PLATFORM_NAME, poolmgr::VERSION, role);

    // The simulator backends stand in until real transports are attached;
    // the wire layer delivers validated requests into the same context.
    let (ctx, _xenops_sim, _storage_sim) = Context::sim();
    let ctx = wire_config(ctx, config);

    let locations = load_db_conf(&ctx.config.db_conf_path).unwrap_or_else(|_| {
        vec![DbLocation {
            path: PathBuf::from("/var/lib/poolmgr/state.db"),
        }]
    });
    let persistence = Arc::new(Persistence::new(
        locations,
        Some(ctx.config.db_restore_path.clone()),
    ));

    let emergency = Arc::new(bootstrap::EmergencyMode::new());
    let scheduler = poolmgr::scheduler::PeriodicScheduler::new();

    match &role {
        bootstrap::PoolRole::Master => {}
        bootstrap::PoolRole::Slave(address) => {
            // The join itself is driven by the peer transport once it is
            // attached; until then most operations are refused
            emergency.enter(&format!("waiting to join the coordinator at {}", address));
        }
        bootstrap::PoolRole::Broken => {
            emergency.enter("pool configuration is damaged");
            emergency.schedule_restart(
                Duration::from_secs(ctx.config.emergency_restart_base_secs),
                Duration::from_secs(ctx.config.emergency_restart_jitter_secs),
                || std::process::exit(0),
            );
        }
    }

    let mut sequencer = StartupSequencer::new();
    register_startup_tasks(
        &mut sequencer,
        &ctx,
        &persistence,
        &local,
        &emergency,
        &scheduler,
    );
    if let Err(e) = sequencer.run(&role) {
        log::error!("startup aborted: {}", e);
        std::process::exit(1);
    }

    // The pump handles live for the rest of the process
    let _pump_handles = if ctx.config.noevents {
        log::warn!("event pumps disabled (noevents)");
        None
    } else {
        Some(pumps::start(
            ctx.xenops.clone(),
            ctx.config.event_pump_backoff(),
        ))
    };
    scheduler.start();
    log::info!("steady state reached");

    // Park until the service manager stops us
    loop {
        std::thread::sleep(Duration::from_secs(3600));
        if emergency.is_active() {
            log::warn!(
                "still in emergency mode: {}",
                emergency.reason().unwrap_or_default()
            );
        }
    }
}

/// Rebuild the context around the loaded configuration
fn wire_config(ctx: Arc<Context>, config: Config) -> Arc<Context> {
    let db = ctx.db.clone();
    let bus = ctx.bus.clone();
    let localhost = ctx.localhost.clone();
    let tasks = Arc::new(TaskManager::new(db.clone(), localhost.clone()));
    let storage = ctx.storage.clone();
    let client = ctx.xenops.client.clone();
    Arc::new(Context::new(
        config, db, bus, tasks, client, storage, localhost,
    ))
}

fn register_startup_tasks(
    sequencer: &mut StartupSequencer,
    ctx: &Arc<Context>,
    persistence: &Arc<Persistence>,
    local: &Arc<LocalDb>,
    emergency: &Arc<bootstrap::EmergencyMode>,
    scheduler: &poolmgr::scheduler::PeriodicScheduler,
) {
    {
        let ctx = ctx.clone();
        let persistence = persistence.clone();
        sequencer.add(
            "load database",
            TaskFlags {
                only_master: true,
                ..Default::default()
            },
            move || {
                persistence
                    .load_into(&ctx.db)
                    .map_err(|e| e.to_string())?;
                ctx.db.add_sink(persistence.clone());
                Ok(())
            },
        );
    }
    {
        let ctx = ctx.clone();
        sequencer.add(
            "attach replication feed",
            TaskFlags {
                only_master: true,
                ..Default::default()
            },
            move || {
                ctx.db.add_sink(Arc::new(ReplicationFeed::new()));
                Ok(())
            },
        );
    }
    {
        let ctx = ctx.clone();
        sequencer.add(
            "signal database ready",
            TaskFlags {
                only_master: true,
                ..Default::default()
            },
            move || {
                ctx.ready.set_ready();
                Ok(())
            },
        );
    }
    {
        let local = local.clone();
        let ctx = ctx.clone();
        sequencer.add(
            "apply boot-time host flags",
            TaskFlags {
                no_exn_raising: true,
                ..Default::default()
            },
            move || {
                if local.get_bool(keys::HOST_DISABLED_UNTIL_REBOOT) {
                    let localhost = ctx.localhost.clone();
                    let _ = ctx.db.hosts.update(&localhost, |host| host.enabled = false);
                }
                Ok(())
            },
        );
    }
    {
        let ctx = ctx.clone();
        sequencer.add(
            "reconcile resident domains",
            TaskFlags {
                no_exn_raising: true,
                ..Default::default()
            },
            move || {
                ctx.xenops
                    .resync_resident_on()
                    .map_err(|e| e.to_string())?;
                ctx.xenops.refresh_resident_vms(Duration::from_secs(30));
                Ok(())
            },
        );
    }
    {
        let ctx = ctx.clone();
        let local = local.clone();
        let emergency = emergency.clone();
        sequencer.add(
            "verify HA consistency",
            TaskFlags {
                only_slave: true,
                no_exn_raising: true,
                ..Default::default()
            },
            move || {
                if let Err(reason) = bootstrap::startup::check_ha_consistency(&ctx.db, &local) {
                    if let Some(host) = ctx.db.hosts.try_get(&ctx.localhost) {
                        poolmgr::message::post(
                            &ctx.db,
                            "HA_STATE_INCONSISTENT",
                            poolmgr::message::priority::WARNING,
                            poolmgr::db::models::Class::Host,
                            host.uuid,
                            &reason,
                        );
                    }
                    emergency.enter(&reason);
                }
                Ok(())
            },
        );
    }
    {
        let ctx = ctx.clone();
        sequencer.add(
            "push guest-agent policy",
            TaskFlags {
                no_exn_raising: true,
                ..Default::default()
            },
            move || ctx.xenops.sync_guest_agent_features().map_err(|e| e.to_string()),
        );
    }
    // Periodic jobs
    {
        let ctx = ctx.clone();
        let persistence = persistence.clone();
        scheduler.register("db-flush", ctx.config.db_flush_interval(), move || {
            if let Err(e) = persistence.flush(&ctx.db) {
                log::error!("database flush lost quorum: {}", e);
                std::process::exit(1);
            }
        });
    }
    {
        let ctx = ctx.clone();
        scheduler.register("task-gc", ctx.config.task_gc_interval(), move || {
            ctx.tasks.gc(ctx.config.task_max_age());
        });
    }
    {
        let ctx = ctx.clone();
        scheduler.register("auto-scan", Duration::from_secs(30), move || {
            for sr in ctx.db.srs.list() {
                if sr.auto_scan() {
                    if let Err(e) = poolmgr::lifecycle::sr::scan(&ctx, &sr.reference) {
                        log::warn!("auto-scan of {} failed: {}", sr.reference, e);
                        poolmgr::message::post(
                            &ctx.db,
                            "SR_SCAN_FAILED",
                            poolmgr::message::priority::WARNING,
                            poolmgr::db::models::Class::Sr,
                            sr.uuid,
                            &e.to_string(),
                        );
                    }
                }
            }
        });
    }
    {
        let ctx = ctx.clone();
        let local = local.clone();
        scheduler.register("master-claims-check", Duration::from_secs(60), move || {
            if let Some(role) =
                bootstrap::role::detect_other_master(&ctx.db, &ctx.localhost, &local)
            {
                log::error!("demoted to {:?}; restarting", role);
                std::process::exit(0);
            }
        });
    }
}
