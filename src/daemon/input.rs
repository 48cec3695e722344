// Input worker
//
// Validates, deduplicates and persists arriving bundles, then hands
// them to the main worker. Runs until the shutdown event arrives.

use crate::bundle::{StatusFlags, StatusReportReason};
use crate::daemon::main_worker::send_status_report;
use crate::daemon::DaemonState;
use crate::event::{BundleSource, DaemonEvent, Processor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const POP_TIMEOUT: Duration = Duration::from_millis(250);

pub fn run(state: Arc<DaemonState>) {
    info!("input worker running");
    loop {
        let Some(queued) = state.queues.input.pop(POP_TIMEOUT) else {
            if state.should_stop() {
                break;
            }
            continue;
        };
        state.counters.bump(&state.counters.events_processed);
        let stop = matches!(queued.event, DaemonEvent::Shutdown);
        handle_event(&state, &queued.event);
        queued.complete();
        if stop {
            break;
        }
    }
    info!("input worker exiting");
}

fn handle_event(state: &Arc<DaemonState>, event: &DaemonEvent) {
    match event {
        DaemonEvent::BundleReceived {
            bundle,
            source,
            prev_hop,
        } => handle_bundle_received(state, bundle.clone(), source.clone(), prev_hop),
        DaemonEvent::Shutdown => {}
        other => unreachable!("input worker got {:?}", other.label()),
    }
}

fn handle_bundle_received(
    state: &Arc<DaemonState>,
    bundle: crate::bundle::BundleRef,
    source: BundleSource,
    _prev_hop: &crate::naming::EndpointId,
) {
    state.counters.bump(&state.counters.received);

    if bundle.expired() {
        warn!(bundle = %*bundle, "arrived already expired");
        state.counters.bump(&state.counters.expired);
        if bundle.deletion_rcpt {
            send_status_report(
                state,
                &bundle,
                StatusFlags::deleted(),
                StatusReportReason::LifetimeExpired,
            );
        }
        return;
    }

    if bundle.is_fragment
        && (bundle.frag_length > bundle.orig_length
            || bundle.frag_offset + bundle.frag_length > bundle.orig_length)
    {
        warn!(bundle = %*bundle, "fragment fields inconsistent, rejecting");
        state.counters.bump(&state.counters.rejected);
        return;
    }

    // duplicate suppression by GBOF
    if state.config.suppress_duplicates {
        if let Some(original) = state.store.find_by_gbof(&bundle.gbof()) {
            debug!(
                bundle = %*bundle,
                original = original.id,
                "duplicate arrival suppressed"
            );
            state.counters.bump(&state.counters.duplicate);
            // the duplicate counts as delivered for forwarding-log
            // purposes on the original, then disappears
            state.counters.bump(&state.counters.deleted);
            return;
        }
    }

    if let Err(e) = state.store.insert(bundle.clone()) {
        warn!("bundle insert failed: {}", e);
        state.counters.bump(&state.counters.rejected);
        return;
    }
    state.store.add_to_pending(&bundle);
    state.schedule_expiration(&bundle);

    // durable before the main worker sees it
    state.post_to(
        Processor::Storage,
        DaemonEvent::StoreBundleUpdate {
            bundle: bundle.clone(),
        },
    );
    bundle.with_state(|s| s.queued_for_datastore = true);

    if bundle.receive_rcpt {
        send_status_report(
            state,
            &bundle,
            StatusFlags::received(),
            StatusReportReason::NoAdditionalInfo,
        );
    }

    state.post_to(
        Processor::Main,
        DaemonEvent::BundleAccepted {
            bundle,
            source,
            duplicate: false,
        },
    );
}
