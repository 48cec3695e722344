// Output worker
//
// Queues bundles on links and kicks the owning convergence layer. The
// CL reports outcomes back through the event sink; backpressure comes
// from its ready_for_bundles callback, so this worker never spins on a
// throttled link.

use crate::bundle::{ForwardingAction, ForwardingState};
use crate::daemon::DaemonState;
use crate::event::{DaemonEvent, Processor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const POP_TIMEOUT: Duration = Duration::from_millis(250);

pub fn run(state: Arc<DaemonState>) {
    info!("output worker running");
    loop {
        let Some(queued) = state.queues.output.pop(POP_TIMEOUT) else {
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
    info!("output worker exiting");
}

fn handle_event(state: &Arc<DaemonState>, event: &DaemonEvent) {
    match event {
        DaemonEvent::SendBundle {
            bundle,
            link,
            action,
        } => handle_send_bundle(state, bundle.clone(), link, *action),
        DaemonEvent::LinkReady { link } => handle_link_ready(state, link),
        DaemonEvent::Shutdown => {}
        other => unreachable!("output worker got {:?}", other.label()),
    }
}

fn handle_send_bundle(
    state: &Arc<DaemonState>,
    bundle: crate::bundle::BundleRef,
    link_name: &str,
    action: ForwardingAction,
) {
    let Some(link) = state.contacts.find_link(link_name) else {
        warn!(link = link_name, "send on unknown link");
        bundle.fwd_log_add(link_name, action, ForwardingState::TransmitFailed);
        state.post_to(
            Processor::Main,
            DaemonEvent::BundleTransmitted {
                bundle,
                link: link_name.to_string(),
                bytes_sent: 0,
                reliably_sent: false,
                success: false,
            },
        );
        return;
    };
    let Some(cl) = state.cls.find(&link.cl_name) else {
        warn!(link = link_name, cl = %link.cl_name, "send with unknown CL");
        return;
    };

    if !link.enqueue(bundle.clone()) {
        debug!(bundle = %*bundle, link = link_name, "already queued on link");
        return;
    }
    bundle.fwd_log_add(link_name, action, ForwardingState::InFlight);

    if cl.ready_for_bundles(&link) {
        if let Err(e) = cl.bundle_queued(&link, &bundle) {
            warn!(link = link_name, "convergence layer refused bundle: {}", e);
        }
    }
}

/// The CL signalled it can take more; hand it the head of the queue.
fn handle_link_ready(state: &Arc<DaemonState>, link_name: &str) {
    let Some(link) = state.contacts.find_link(link_name) else {
        return;
    };
    let Some(cl) = state.cls.find(&link.cl_name) else {
        return;
    };
    if let Some(head) = link.peek_queued() {
        if let Err(e) = cl.bundle_queued(&link, &head) {
            warn!(link = link_name, "convergence layer refused bundle: {}", e);
        }
    }
}
