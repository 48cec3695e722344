// ACS worker
//
// Owns the pending aggregate-signal map. Custody acceptances arrive as
// AddBundleToAcs events; the worker folds them into run-length entries,
// persists each delta, and flushes on size or delay. Inbound aggregate
// signals are expanded to custody ids and resolved against the custody
// index, posting one release per bundle to the main worker.

use crate::bundle::{AcsPayload, Bundle, Payload};
use crate::custody::{AcsKey, AcsParams, AcsSubsystem};
use crate::daemon::DaemonState;
use crate::event::{BundleSource, DaemonEvent, Processor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const POP_TIMEOUT: Duration = Duration::from_millis(250);

pub fn run(state: Arc<DaemonState>) {
    info!("acs worker running");
    let params = AcsParams::new(
        state.config.acs_enabled,
        state.config.acs_delay,
        state.config.acs_size,
    );
    let mut acs = AcsSubsystem::new(params);
    reload_pending(&state, &mut acs);

    loop {
        let Some(queued) = state.queues.acs.pop(POP_TIMEOUT) else {
            if state.should_stop() {
                break;
            }
            continue;
        };
        state.counters.bump(&state.counters.events_processed);
        acs.stats.events_processed += 1;
        let stop = matches!(queued.event, DaemonEvent::Shutdown);
        handle_event(&state, &mut acs, &queued.event);
        queued.complete();
        if stop {
            break;
        }
    }
    // outstanding signals survive in the pending-ACS table and are
    // flushed by the next boot
    info!("acs worker exiting");
}

/// Boot-time reload: outstanding signals flush immediately.
fn reload_pending(state: &Arc<DaemonState>, acs: &mut AcsSubsystem) {
    let records = match state.durable.load_pending_acs() {
        Ok(records) => records,
        Err(e) => {
            warn!("pending acs reload failed: {}", e);
            return;
        }
    };
    if records.is_empty() {
        return;
    }
    acs.load(records);
    for key in acs.pending_keys() {
        flush_signal(state, acs, &key);
    }
}

fn handle_event(state: &Arc<DaemonState>, acs: &mut AcsSubsystem, event: &DaemonEvent) {
    match event {
        DaemonEvent::AddBundleToAcs {
            bundle_id,
            custody_id,
            prev_custodian,
            succeeded,
            reason,
        } => {
            let key = AcsKey {
                custodian: prev_custodian.clone(),
                succeeded: *succeeded,
                reason: *reason,
            };
            handle_add(state, acs, &key, *bundle_id, *custody_id);
        }
        DaemonEvent::AcsExpired {
            custodian,
            succeeded,
            reason,
        } => {
            let key = AcsKey {
                custodian: custodian.clone(),
                succeeded: *succeeded,
                reason: *reason,
            };
            debug!(%key, "acs delay expired");
            flush_signal(state, acs, &key);
        }
        DaemonEvent::AggregateCustodySignal { acs: payload } => {
            handle_inbound(state, acs, payload);
        }
        DaemonEvent::Shutdown => {}
        other => unreachable!("acs worker got {:?}", other.label()),
    }
}

fn handle_add(
    state: &Arc<DaemonState>,
    acs: &mut AcsSubsystem,
    key: &AcsKey,
    bundle_id: u64,
    custody_id: u64,
) {
    let (enabled, delay, _) = acs.params.lookup(&key.custodian);
    if !enabled {
        // route explicitly opted out after the main worker's check;
        // nothing pends, the plain signal path already ran there
        debug!(%key, bundle_id, "acs disabled for route");
        return;
    }
    let outcome = acs.insert(key, custody_id);

    if outcome.first_of_signal {
        let queue = state.queues.acs.clone();
        let timer_key = key.clone();
        let token = state
            .timers
            .schedule_after(Duration::from_secs(u64::from(delay)), move || {
                queue.post(DaemonEvent::AcsExpired {
                    custodian: timer_key.custodian.clone(),
                    succeeded: timer_key.succeeded,
                    reason: timer_key.reason,
                });
            });
        acs.set_timer(key, token);
    }

    if outcome.should_flush {
        flush_signal(state, acs, key);
    } else if let Some(record) = acs.record(key) {
        // every delta is durable so a restart can flush it
        state.post_to(
            Processor::Storage,
            DaemonEvent::StorePendingAcsUpdate { record },
        );
    }
}

/// Encode the pending signal as an admin bundle and hand it to input.
fn flush_signal(state: &Arc<DaemonState>, acs: &mut AcsSubsystem, key: &AcsKey) {
    let Some(payload) = acs.flush(key) else {
        return;
    };
    let ids = payload.custody_ids().len();
    let admin = Bundle::builder(state.local_eid.clone(), key.custodian.clone())
        .admin()
        .payload(Payload::in_memory(payload.encode()))
        .build(state.id_source.next_id());
    state.inject_bundle(admin, BundleSource::Admin);
    state.post_to(
        Processor::Storage,
        DaemonEvent::StorePendingAcsDelete {
            key: key.store_key(),
        },
    );
    info!(%key, ids, "aggregate custody signal generated");
}

/// Expand an inbound aggregate signal and release matching custody.
fn handle_inbound(state: &Arc<DaemonState>, acs: &mut AcsSubsystem, payload: &AcsPayload) {
    let releases = payload.succeeded
        || payload.reason == crate::bundle::CustodySignalReason::RedundantReception;
    let redundant = !payload.succeeded;
    for custody_id in payload.custody_ids() {
        let Some(bundle) = state.store.find_by_custody_id(custody_id) else {
            acs.stats.not_found += 1;
            debug!(custody_id, "aggregate signal for unknown custody id");
            continue;
        };
        if !releases {
            warn!(
                bundle = %*bundle,
                reason = ?payload.reason,
                "aggregate custody failure"
            );
            continue;
        }
        acs.stats.released += 1;
        state.post_to(
            Processor::Main,
            DaemonEvent::ReleaseCustody {
                bundle_id: bundle.id,
                redundant,
            },
        );
    }
}
