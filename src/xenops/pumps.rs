//! Event Pumps
//!
//! Two long-running loops per daemon queue:
//! - events-from-xapi: watches database events for this host and its
//!   resident VMs and re-pushes metadata when a record changed. A host
//!   self-event is the wake signal to re-register the subscription list.
//! - events-from-xenopsd: polls the daemon's updates endpoint, routes each
//!   event to its handler, and signals barrier waiters.
//!
//! Neither loop dies on a per-event error. Transport failures restart the
//! loop from an empty token after a backoff, with a resync in between.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::db::models::Class;
use crate::events::{ClassFilter, EventFilter};

use super::XenopsAdapter;

/// How long each blocking read waits before re-checking for shutdown
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Handles on the running pumps
pub struct PumpHandles {
    shutdown: Sender<()>,
    threads: Vec<JoinHandle<()>>,
}

impl PumpHandles {
    pub fn stop(mut self) {
        drop(self.shutdown);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Start both pumps for the adapter's queue
pub fn start(adapter: Arc<XenopsAdapter>, backoff: Duration) -> PumpHandles {
    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

    let mut threads = Vec::new();
    {
        let adapter = adapter.clone();
        let shutdown = shutdown_rx.clone();
        threads.push(
            std::thread::Builder::new()
                .name("events-from-xapi".to_string())
                .spawn(move || xapi_loop(adapter, shutdown))
                .expect("spawning xapi event pump"),
        );
    }
    {
        let shutdown = shutdown_rx;
        threads.push(
            std::thread::Builder::new()
                .name(format!("events-from-xenopsd-{}", adapter.queue))
                .spawn(move || xenops_loop(adapter, backoff, shutdown))
                .expect("spawning xenopsd event pump"),
        );
    }
    PumpHandles {
        shutdown: shutdown_tx,
        threads,
    }
}

fn stopping(shutdown: &Receiver<()>) -> bool {
    matches!(
        shutdown.try_recv(),
        Err(crossbeam_channel::TryRecvError::Disconnected)
    )
}

/// The subscription list: our own host row plus every resident VM
fn resident_filter(adapter: &XenopsAdapter) -> EventFilter {
    let mut filter = EventFilter::default();
    filter.push(ClassFilter::Object(Class::Host, adapter.localhost.clone()));
    for vm in adapter.db.vms.list() {
        if vm.resident_on == adapter.localhost {
            filter.push(ClassFilter::Object(Class::Vm, vm.reference.clone()));
        }
    }
    filter
}

fn xapi_loop(adapter: Arc<XenopsAdapter>, shutdown: Receiver<()>) {
    log::info!("events-from-xapi pump starting");
    let subscription = adapter.bus.subscribe(resident_filter(&adapter));
    let mut token = String::new();
    loop {
        if stopping(&shutdown) {
            break;
        }
        let filter = resident_filter(&adapter);
        let _ = adapter.bus.set_filter(subscription, filter.clone());
        let batch = match adapter.bus.from(&filter, &token, READ_TIMEOUT) {
            Ok(batch) => batch,
            Err(e) => {
                // Start over from scratch, re-loading everything
                log::warn!("xapi event read failed, restarting from empty token: {}", e);
                token = String::new();
                continue;
            }
        };
        let mut reregister = false;
        for event in &batch.events {
            match event.class {
                Class::Host => {
                    // The wake signal: resident_VMs may have changed
                    reregister = true;
                }
                Class::Vm => {
                    if let Err(e) = adapter.update_metadata_if_changed(&event.reference) {
                        log::warn!("metadata refresh for {} failed: {}", event.reference, e);
                    }
                }
                _ => {}
            }
        }
        if let Ok(parsed) = batch.token.parse::<u64>() {
            adapter.note_xapi_token(parsed);
            adapter.bus.note_processed(subscription, parsed);
        }
        token = batch.token;
        if reregister {
            log::debug!("re-registering xapi event subscription");
        }
    }
    adapter.bus.unsubscribe(subscription);
    log::info!("events-from-xapi pump stopped");
}

fn xenops_loop(adapter: Arc<XenopsAdapter>, backoff: Duration, shutdown: Receiver<()>) {
    log::info!("events-from-xenopsd pump starting on {}", adapter.queue);
    let mut token = String::new();
    loop {
        if stopping(&shutdown) {
            break;
        }
        match adapter.client.updates_get(adapter.dbg(), &token, READ_TIMEOUT) {
            Ok((barriers, events, next)) => {
                // Everything delivered in this batch is applied before any
                // barrier in it is signalled, so a barrier wait really means
                // "processed up to here"
                for barrier in &barriers {
                    for event in &barrier.events {
                        adapter.route_update(event);
                    }
                }
                for event in &events {
                    adapter.route_update(event);
                }
                for barrier in &barriers {
                    adapter.barriers.signal(barrier.id);
                }
                token = next;
            }
            Err(e) => {
                log::warn!(
                    "updates transport on {} failed ({}), backing off {:?}",
                    adapter.queue,
                    e,
                    backoff
                );
                if shutdown.recv_timeout(backoff).is_err()
                    && stopping(&shutdown)
                {
                    break;
                }
                if let Err(e) = adapter.resync_resident_on() {
                    log::warn!("resync after transport failure: {}", e);
                }
                token = String::new();
            }
        }
    }
    log::info!("events-from-xenopsd pump on {} stopped", adapter.queue);
}
