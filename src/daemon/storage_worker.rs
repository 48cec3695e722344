// Storage worker
//
// Serializes every durable mutation: bundle add/update/delete,
// registration and link records, and pending aggregate signals. Runs
// the updates in arrival order and drains its queue before exiting on
// shutdown.

use crate::daemon::DaemonState;
use crate::event::DaemonEvent;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const POP_TIMEOUT: Duration = Duration::from_millis(250);

pub fn run(state: Arc<DaemonState>) {
    info!("storage worker running");
    loop {
        let Some(queued) = state.queues.storage.pop(POP_TIMEOUT) else {
            if state.should_stop() {
                // flush whatever raced in after the stop flag
                drain(&state);
                break;
            }
            continue;
        };
        state.counters.bump(&state.counters.events_processed);
        if matches!(queued.event, DaemonEvent::Shutdown) {
            queued.complete();
            drain(&state);
            break;
        }
        handle_event(&state, &queued.event);
        queued.complete();
    }
    info!("storage worker exiting");
}

fn drain(state: &Arc<DaemonState>) {
    while let Some(queued) = state.queues.storage.pop(Duration::from_millis(1)) {
        if !matches!(queued.event, DaemonEvent::Shutdown) {
            handle_event(state, &queued.event);
        }
        queued.complete();
    }
}

fn handle_event(state: &Arc<DaemonState>, event: &DaemonEvent) {
    let result = match event {
        DaemonEvent::StoreBundleUpdate { bundle } => state.durable.put_bundle(bundle),
        DaemonEvent::StoreBundleDelete { bundle_id } => state.durable.del_bundle(*bundle_id),
        DaemonEvent::StoreRegUpdate { regid } => match state.registrations.get(*regid) {
            Some(reg) => state.durable.put_registration(&reg.record()),
            None => {
                warn!(regid, "store update for vanished registration");
                Ok(())
            }
        },
        DaemonEvent::StoreRegDelete { regid } => state.durable.del_registration(*regid),
        DaemonEvent::StoreLinkUpdate { link } => match state.contacts.find_link(link) {
            Some(link) => state.durable.put_link(&link.record()),
            None => {
                warn!(link, "store update for vanished link");
                Ok(())
            }
        },
        DaemonEvent::StoreLinkDelete { link } => state.durable.del_link(link),
        DaemonEvent::StorePendingAcsUpdate { record } => {
            let key = crate::custody::AcsKey {
                custodian: record.custodian.clone(),
                succeeded: record.succeeded,
                reason: record.reason,
            };
            state.durable.put_pending_acs(&key.store_key(), record)
        }
        DaemonEvent::StorePendingAcsDelete { key } => state.durable.del_pending_acs(key),
        DaemonEvent::Shutdown => Ok(()),
        other => unreachable!("storage worker got {:?}", other.label()),
    };
    if let Err(e) = result {
        error!(event = event.label(), "durable update failed: {}", e);
    }
}
