// Main worker
//
// Owns the canonical bundle lifecycle: admission, custody, delivery,
// routing, expiration, link state and the shutdown protocol. Every
// event class has a typed handler; an unhandled event here is a bug.

use crate::bundle::{
    dtn_time_now, Bundle, BundleRef, Cteb, CustodySignal, CustodySignalReason, ForwardingAction,
    ForwardingState, Payload, StatusFlags, StatusReport, StatusReportReason,
};
use crate::contacts::{LinkState, LinkType};
use crate::daemon::DaemonState;
use crate::event::{BundleSource, DaemonEvent, Processor};
use crate::naming::EndpointId;
use crate::reg::{handle_admin_bundle, AdminContext, DeliveryOutcome, RegVariant};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const POP_TIMEOUT: Duration = Duration::from_millis(250);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

pub fn run(state: Arc<DaemonState>) {
    info!("main worker running");
    loop {
        let Some(queued) = state.queues.main.pop(POP_TIMEOUT) else {
            if state.should_stop() {
                break;
            }
            continue;
        };
        state.counters.bump(&state.counters.events_processed);
        let stop = matches!(queued.event, DaemonEvent::Shutdown);
        handle_event(&state, &queued.event);
        state.router().handle_event(&queued.event, &state);
        queued.complete();
        if stop {
            break;
        }
    }
    info!("main worker exiting");
}

fn handle_event(state: &Arc<DaemonState>, event: &DaemonEvent) {
    match event {
        DaemonEvent::BundleAccepted { bundle, source, .. } => {
            handle_bundle_accepted(state, bundle, source)
        }
        DaemonEvent::DeliverBundleToReg { bundle, regid } => {
            handle_deliver_to_reg(state, bundle, *regid)
        }
        DaemonEvent::BundleDelivered { bundle, regid } => {
            handle_bundle_delivered(state, bundle, *regid)
        }
        DaemonEvent::BundleTransmitted {
            bundle,
            link,
            bytes_sent,
            reliably_sent,
            success,
        } => handle_bundle_transmitted(state, bundle, link, *bytes_sent, *reliably_sent, *success),
        DaemonEvent::BundleExpired { bundle_id } => handle_bundle_expired(state, *bundle_id),
        DaemonEvent::TryDeleteBundle { bundle_id } => try_delete_bundle(state, *bundle_id),
        DaemonEvent::CustodyTimeout { bundle_id, link } => {
            handle_custody_timeout(state, *bundle_id, link)
        }
        DaemonEvent::CustodySignalReceived { signal } => handle_custody_signal(state, signal),
        DaemonEvent::ReleaseCustody {
            bundle_id,
            redundant,
        } => handle_release_custody(state, *bundle_id, *redundant),
        DaemonEvent::BundleCustodyAccepted { .. } => {
            // router observation only; handled by the post-event hook
        }
        DaemonEvent::LinkStateChange {
            link,
            state: next,
            reason,
        } => handle_link_state_change(state, link, *next, reason),
        DaemonEvent::ContactUp { link } => handle_contact_up(state, link),
        DaemonEvent::ContactDown { link, reason } => handle_contact_down(state, link, reason),
        DaemonEvent::RegistrationAdded { regid } => handle_registration_added(state, *regid),
        DaemonEvent::RegistrationRemoved { regid } => {
            state.post_to(Processor::Storage, DaemonEvent::StoreRegDelete { regid: *regid });
        }
        DaemonEvent::Shutdown => handle_shutdown(state),
        other => unreachable!("main worker got {:?}", other.label()),
    }
}

// ---------------------------------------------------------------- admission

fn handle_bundle_accepted(state: &Arc<DaemonState>, bundle: &BundleRef, source: &BundleSource) {
    debug!(bundle = %**bundle, ?source, "bundle accepted");

    if bundle.custody_requested && state.config.accept_custody && !bundle.local_custody() {
        accept_custody(state, bundle);
    }

    let delivered_locally = check_local_delivery(state, bundle);
    let routed = route_bundle(state, bundle);
    if !delivered_locally && !routed {
        debug!(bundle = %**bundle, "no delivery and no route; bundle stays pending");
    }
}

/// Mark PENDING_DELIVERY for every matching registration in one
/// store transaction, then queue one delivery event each.
fn check_local_delivery(state: &Arc<DaemonState>, bundle: &BundleRef) -> bool {
    let matches = state.registrations.matching(&bundle.dest);
    if matches.is_empty() {
        return false;
    }
    for reg in &matches {
        bundle.fwd_log_add(
            &reg_target(reg.regid),
            ForwardingAction::ForwardAction,
            ForwardingState::PendingDelivery,
        );
    }
    state.post_to(
        Processor::Storage,
        DaemonEvent::StoreBundleUpdate {
            bundle: bundle.clone(),
        },
    );
    for reg in &matches {
        state.post_to(
            Processor::Main,
            DaemonEvent::DeliverBundleToReg {
                bundle: bundle.clone(),
                regid: reg.regid,
            },
        );
    }
    true
}

fn route_bundle(state: &Arc<DaemonState>, bundle: &BundleRef) -> bool {
    let routes = state.router().route_bundle(bundle, state);
    for (link, action) in &routes {
        state.post_to(
            Processor::Output,
            DaemonEvent::SendBundle {
                bundle: bundle.clone(),
                link: link.clone(),
                action: *action,
            },
        );
    }
    !routes.is_empty()
}

// ----------------------------------------------------------------- delivery

fn handle_deliver_to_reg(state: &Arc<DaemonState>, bundle: &BundleRef, regid: u32) {
    let Some(reg) = state.registrations.get(regid) else {
        warn!(regid, "delivery to vanished registration");
        return;
    };
    match reg.deliver(bundle) {
        DeliveryOutcome::Delivered => {
            if matches!(
                reg.variant,
                RegVariant::Admin | RegVariant::AdminIpn | RegVariant::Ping | RegVariant::IpnEcho
            ) {
                dispatch_admin(state, bundle);
            }
            state.post_to(
                Processor::Main,
                DaemonEvent::BundleDelivered {
                    bundle: bundle.clone(),
                    regid,
                },
            );
        }
        DeliveryOutcome::Duplicate => {
            state.counters.bump(&state.counters.suppressed_delivery);
            bundle.fwd_log_update(&reg_target(regid), ForwardingState::SuppressedDelivery);
            state.post_to(
                Processor::Main,
                DaemonEvent::TryDeleteBundle { bundle_id: bundle.id },
            );
        }
        DeliveryOutcome::Refused => {
            debug!(regid, bundle = %**bundle, "registration refused delivery");
        }
    }
}

fn dispatch_admin(state: &Arc<DaemonState>, bundle: &BundleRef) {
    let ctx = AdminContext {
        local_eid: state.local_eid.clone(),
        ipn_echo_service_number: state.config.ipn_echo_service_number,
        ipn_echo_max_return_length: state.config.ipn_echo_max_return_length,
        id_source: &state.id_source,
    };
    match handle_admin_bundle(bundle, &ctx) {
        Ok(disposition) => {
            for event in disposition.events {
                state.post(event);
            }
            if let Some(echo) = disposition.echo {
                state.inject_bundle(echo, BundleSource::Admin);
            }
        }
        Err(e) => {
            warn!(bundle = %**bundle, "admin dispatch failed: {}", e);
            state.counters.bump(&state.counters.rejected);
        }
    }
}

/// The only place the DELIVERED forwarding-log state is written.
fn handle_bundle_delivered(state: &Arc<DaemonState>, bundle: &BundleRef, regid: u32) {
    bundle.fwd_log_update(&reg_target(regid), ForwardingState::Delivered);
    bundle.with_state(|s| {
        if !s.delivered_regids.contains(&regid) {
            s.delivered_regids.push(regid);
        }
    });
    state.counters.bump(&state.counters.delivered);

    if bundle.delivery_rcpt {
        send_status_report(
            state,
            bundle,
            StatusFlags::delivered(),
            StatusReportReason::NoAdditionalInfo,
        );
    }

    if bundle.singleton_dest {
        remove_from_pending(state, bundle);
        state.post_to(
            Processor::Storage,
            DaemonEvent::StoreBundleUpdate {
                bundle: bundle.clone(),
            },
        );
        state.post_to(
            Processor::Main,
            DaemonEvent::TryDeleteBundle { bundle_id: bundle.id },
        );
    }
}

// ------------------------------------------------------------- transmission

fn handle_bundle_transmitted(
    state: &Arc<DaemonState>,
    bundle: &BundleRef,
    link_name: &str,
    bytes_sent: u64,
    reliably_sent: bool,
    success: bool,
) {
    if let Some(link) = state.contacts.find_link(link_name) {
        link.finish_inflight(bundle.id, bytes_sent, success);
    }

    if !success {
        bundle.fwd_log_update(link_name, ForwardingState::TransmitFailed);
        if state.config.retry_reliable_unacked && reliably_sent {
            // reliable link cancelled the send; ask the router again
            route_bundle(state, bundle);
        }
        return;
    }

    bundle.fwd_log_update(link_name, ForwardingState::Transmitted);
    state.counters.bump(&state.counters.transmitted);

    if bundle.forward_rcpt {
        send_status_report(
            state,
            bundle,
            StatusFlags {
                forwarded: true,
                ..Default::default()
            },
            StatusReportReason::NoAdditionalInfo,
        );
    }

    if bundle.local_custody() {
        // hold pending until the next custodian acknowledges
        let armed = state.custody_timers.start(
            &state.timers,
            state.queues.main.clone(),
            bundle,
            link_name,
            Duration::from_secs(u64::from(state.config.custody_timer_intvl)),
            state.config.custody_timer_retries,
        );
        if armed.is_none() {
            warn!(bundle = %**bundle, link = link_name, "custody retries exhausted");
        }
        return;
    }

    remove_from_pending(state, bundle);
    state.post_to(
        Processor::Main,
        DaemonEvent::TryDeleteBundle { bundle_id: bundle.id },
    );
}

fn handle_custody_timeout(state: &Arc<DaemonState>, bundle_id: u64, link: &str) {
    let Some(bundle) = state.store.get(bundle_id) else {
        return;
    };
    debug!(bundle = %*bundle, link, "custody timeout");
    state.custody_timers.handle_timeout(&bundle, link);
    if !state.store.is_pending(bundle_id) {
        state.store.add_to_pending(&bundle);
    }
    route_bundle(state, &bundle);
}

// ------------------------------------------------------------------ custody

fn accept_custody(state: &Arc<DaemonState>, bundle: &BundleRef) {
    let previous = bundle.custodian();
    let custody_id = state.custody_ids.next_id();

    // acknowledge the previous custodian, aggregated when possible
    if !previous.is_null() {
        let cteb = bundle.cteb();
        let use_acs = state.config.acs_enabled && bundle.cteb_valid();
        match (use_acs, cteb) {
            (true, Some(cteb)) => {
                state.post_to(
                    Processor::Acs,
                    DaemonEvent::AddBundleToAcs {
                        bundle_id: bundle.id,
                        custody_id: cteb.custody_id,
                        prev_custodian: previous.clone(),
                        succeeded: true,
                        reason: CustodySignalReason::NoAdditionalInfo,
                    },
                );
            }
            _ => send_custody_signal(state, bundle, &previous, true,
                CustodySignalReason::NoAdditionalInfo),
        }
    }

    // custodian overwrite, CTEB refresh and store update are one unit
    bundle.with_state(|s| {
        s.custodian = state.local_eid.clone();
        s.local_custody = true;
        s.local_custody_id = Some(custody_id);
        s.cteb = Some(Cteb {
            custody_id,
            custodian: state.local_eid.clone(),
        });
    });
    state.store.add_to_custody(bundle, custody_id);
    state.post_to(
        Processor::Storage,
        DaemonEvent::StoreBundleUpdate {
            bundle: bundle.clone(),
        },
    );
    state.post_to(
        Processor::Main,
        DaemonEvent::BundleCustodyAccepted {
            bundle: bundle.clone(),
        },
    );

    if bundle.custody_rcpt {
        send_status_report(
            state,
            bundle,
            StatusFlags::custody_accepted(),
            StatusReportReason::NoAdditionalInfo,
        );
    }
    info!(bundle = %**bundle, custody_id, "custody accepted");
}

fn release_custody(state: &Arc<DaemonState>, bundle: &BundleRef) {
    state.custody_timers.cancel_all(bundle);
    state.store.remove_from_custody(bundle);
    bundle.with_state(|s| {
        s.custodian = EndpointId::Null;
        s.local_custody = false;
        s.local_custody_id = None;
    });
    state.post_to(
        Processor::Storage,
        DaemonEvent::StoreBundleUpdate {
            bundle: bundle.clone(),
        },
    );
    debug!(bundle = %**bundle, "custody released");
}

fn handle_custody_signal(state: &Arc<DaemonState>, signal: &CustodySignal) {
    let Some(bundle) = state.store.find_by_gbof(&signal.gbof()) else {
        debug!(source = %signal.source, "custody signal for unknown bundle");
        return;
    };
    if !bundle.local_custody() {
        return;
    }
    // succeeded, or the peer cancelled but someone already has it
    let releases = signal.succeeded
        || (!signal.succeeded && signal.reason == CustodySignalReason::RedundantReception);
    if releases {
        release_custody(state, &bundle);
        remove_from_pending(state, &bundle);
        state.post_to(
            Processor::Main,
            DaemonEvent::TryDeleteBundle { bundle_id: bundle.id },
        );
    } else {
        warn!(
            bundle = %*bundle,
            reason = ?signal.reason,
            "custody transfer failed downstream"
        );
    }
}

fn handle_release_custody(state: &Arc<DaemonState>, bundle_id: u64, redundant: bool) {
    let Some(bundle) = state.store.get(bundle_id) else {
        return;
    };
    if !bundle.local_custody() {
        return;
    }
    if redundant {
        debug!(bundle = %*bundle, "redundant reception recovery");
    }
    release_custody(state, &bundle);
    remove_from_pending(state, &bundle);
    state.post_to(
        Processor::Main,
        DaemonEvent::TryDeleteBundle { bundle_id },
    );
}

/// Build a (non-aggregate) custody signal bundle for a peer custodian.
fn send_custody_signal(
    state: &Arc<DaemonState>,
    bundle: &BundleRef,
    custodian: &EndpointId,
    succeeded: bool,
    reason: CustodySignalReason,
) {
    let signal = CustodySignal::for_bundle(bundle, succeeded, reason, dtn_time_now());
    let admin = Bundle::builder(state.local_eid.clone(), custodian.clone())
        .bp_version(bundle.bp_version)
        .admin()
        .payload(Payload::in_memory(signal.encode()))
        .build(state.id_source.next_id());
    state.inject_bundle(admin, BundleSource::Admin);
}

// --------------------------------------------------------------- expiration

fn handle_bundle_expired(state: &Arc<DaemonState>, bundle_id: u64) {
    let Some(bundle) = state.store.get(bundle_id) else {
        return;
    };
    info!(bundle = %*bundle, "bundle expired");
    state.counters.bump(&state.counters.expired);

    if bundle.deletion_rcpt {
        send_status_report(
            state,
            &bundle,
            StatusFlags::deleted(),
            StatusReportReason::LifetimeExpired,
        );
    }
    if bundle.local_custody() {
        release_custody(state, &bundle);
    }
    remove_from_pending(state, &bundle);
    delete_bundle(state, &bundle);
}

// ----------------------------------------------------------------- deletion

fn remove_from_pending(state: &Arc<DaemonState>, bundle: &BundleRef) {
    if state.store.remove_from_pending(bundle.id) {
        bundle.with_state(|s| {
            if let Some(token) = s.expiration_timer.take() {
                token.cancel();
            }
        });
    }
}

fn try_delete_bundle(state: &Arc<DaemonState>, bundle_id: u64) {
    let Some(bundle) = state.store.get(bundle_id) else {
        return;
    };
    let router_ok = state.router().can_delete(&bundle, state);
    if !state
        .store
        .deletable(bundle_id, router_ok, state.config.early_deletion)
    {
        return;
    }
    delete_bundle(state, &bundle);
}

fn delete_bundle(state: &Arc<DaemonState>, bundle: &BundleRef) {
    match state.store.erase(bundle.id) {
        Ok(erased) => {
            // delivered and expired bundles already hit a terminal
            // counter; anything else ends here as deleted
            let delivered = erased.with_state(|s| !s.delivered_regids.is_empty());
            if !delivered && !erased.expired() {
                state.counters.bump(&state.counters.deleted);
            }
            state.post_to(
                Processor::Storage,
                DaemonEvent::StoreBundleDelete { bundle_id: erased.id },
            );
        }
        Err(e) => debug!(bundle = %**bundle, "not deletable yet: {}", e),
    }
}

// ------------------------------------------------------------------- links

fn handle_link_state_change(
    state: &Arc<DaemonState>,
    link_name: &str,
    next: LinkState,
    reason: &str,
) {
    let Some(link) = state.contacts.find_link(link_name) else {
        warn!(link = link_name, "state change for unknown link");
        return;
    };
    if let Err(e) = link.set_state(next) {
        error!("{}", e);
        return;
    }
    info!(link = link_name, state = ?next, reason, "link state changed");

    if next == LinkState::Unavailable
        && link.link_type == LinkType::Opportunistic
        && state.config.clear_bundles_when_opp_link_unavailable
    {
        let cleared = link.clear_queue();
        for bundle in cleared {
            bundle.fwd_log_update(link_name, ForwardingState::Cancelled);
        }
    }
    if state.config.persistent_links && link.persistent {
        state.post_to(
            Processor::Storage,
            DaemonEvent::StoreLinkUpdate {
                link: link_name.to_string(),
            },
        );
    }
}

fn handle_contact_up(state: &Arc<DaemonState>, link_name: &str) {
    let Some(link) = state.contacts.find_link(link_name) else {
        return;
    };
    if !link.has_contact() {
        let _ = link.open_contact();
    }
    let _ = link.set_state(LinkState::Open);
    // opening a link may unblock queued bundles
    state.post_to(
        Processor::Output,
        DaemonEvent::LinkReady {
            link: link_name.to_string(),
        },
    );
}

fn handle_contact_down(state: &Arc<DaemonState>, link_name: &str, reason: &str) {
    let Some(link) = state.contacts.find_link(link_name) else {
        return;
    };
    link.close_contact();
    let _ = link.set_state(LinkState::Unavailable);
    info!(link = link_name, reason, "contact down");
}

// -------------------------------------------------------------- registrations

fn handle_registration_added(state: &Arc<DaemonState>, regid: u32) {
    state.post_to(Processor::Storage, DaemonEvent::StoreRegUpdate { regid });
    let Some(reg) = state.registrations.get(regid) else {
        return;
    };
    // deferred delivery: pending bundles that now match
    for bundle in state.store.pending_snapshot() {
        if reg.endpoint.matches(&bundle.dest) {
            bundle.fwd_log_add(
                &reg_target(regid),
                ForwardingAction::ForwardAction,
                ForwardingState::PendingDelivery,
            );
            state.post_to(
                Processor::Main,
                DaemonEvent::DeliverBundleToReg { bundle, regid },
            );
        }
    }
}

// ----------------------------------------------------------------- shutdown

fn handle_shutdown(state: &Arc<DaemonState>) {
    info!("shutdown requested");
    state.timers.pause();

    for link in state.contacts.links() {
        if link.is_open() {
            if let Some(cl) = state.cls.find(&link.cl_name) {
                let _ = cl.close_contact(&link);
            }
            let _ = link.set_state(LinkState::Closed);
        }
    }
    state.cls.shutdown_all();

    // bounded grace period for admin traffic still in flight
    let deadline = Instant::now() + SHUTDOWN_DRAIN;
    while Instant::now() < deadline {
        if state.queues.input.is_empty()
            && state.queues.output.is_empty()
            && state.queues.acs.is_empty()
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    state.signal_stop();
    state.queues.input.post_at_head(DaemonEvent::Shutdown);
    state.queues.output.post_at_head(DaemonEvent::Shutdown);
    state.queues.acs.post_at_head(DaemonEvent::Shutdown);
    // storage drains its queue before exiting, so post at the tail
    state.queues.storage.post(DaemonEvent::Shutdown);
}

// ------------------------------------------------------------------ helpers

pub(crate) fn reg_target(regid: u32) -> String {
    format!("reg-{}", regid)
}

/// Generate a status report admin bundle toward the report-to (or
/// source) endpoint and inject it into the pipeline.
pub(crate) fn send_status_report(
    state: &Arc<DaemonState>,
    bundle: &BundleRef,
    flags: StatusFlags,
    reason: StatusReportReason,
) {
    let dest = if bundle.replyto.is_null() {
        bundle.source.clone()
    } else {
        bundle.replyto.clone()
    };
    if dest.is_null() || dest == state.local_eid {
        return;
    }
    let report = StatusReport::for_bundle(bundle, flags, reason, dtn_time_now());
    let admin = Bundle::builder(state.local_eid.clone(), dest)
        .bp_version(bundle.bp_version)
        .admin()
        .payload(Payload::in_memory(report.encode()))
        .build(state.id_source.next_id());
    state.inject_bundle(admin, BundleSource::Admin);
}
