// Administrative bundle dispatch
//
// Locally destined admin traffic lands on the admin registrations.
// Parsing produces daemon events (custody signals to the main worker,
// aggregate signals to the ACS worker); the IPN variant additionally
// answers pings on the echo service. Dispatch is a pure function so
// the handlers stay testable without a running daemon.

use crate::bundle::store::BundleIdGenerator;
use crate::bundle::{AdminRecord, Bundle, BundleRef, Payload};
use crate::error::{DtnError, Result};
use crate::event::DaemonEvent;
use crate::naming::EndpointId;
use tracing::{debug, info, warn};

pub struct AdminContext<'a> {
    pub local_eid: EndpointId,
    pub ipn_echo_service_number: u64,
    pub ipn_echo_max_return_length: u64,
    pub id_source: &'a BundleIdGenerator,
}

/// What the admin handler wants done with a bundle's contents.
#[derive(Default)]
pub struct AdminDisposition {
    pub events: Vec<DaemonEvent>,
    /// Ping response to inject back into the pipeline.
    pub echo: Option<BundleRef>,
}

/// Dispatch one locally destined admin (or echo) bundle.
pub fn handle_admin_bundle(bundle: &BundleRef, ctx: &AdminContext<'_>) -> Result<AdminDisposition> {
    // IPN echo answers any payload on its service, admin flag or not
    if let (Some(service), EndpointId::Ipn { .. }) = (bundle.dest.service_number(), &ctx.local_eid)
    {
        if service == ctx.ipn_echo_service_number {
            return handle_ping(bundle, ctx);
        }
    }

    if !bundle.is_admin {
        return Err(DtnError::Protocol(format!(
            "non-admin bundle {} delivered to admin registration",
            bundle.id
        )));
    }

    let payload = bundle.payload.read_all()?;
    let record = if bundle.bp_version >= 7 {
        AdminRecord::parse_v7(&payload)?
    } else {
        AdminRecord::parse_v6(&payload)?
    };

    let mut disposition = AdminDisposition::default();
    match record {
        AdminRecord::StatusReport(report) => {
            // reports terminate here; peers do not act on our behalf
            info!(
                source = %report.source,
                flags = ?report.flags,
                reason = ?report.reason,
                "status report received"
            );
        }
        AdminRecord::CustodySignal(signal) => {
            disposition
                .events
                .push(DaemonEvent::CustodySignalReceived { signal });
        }
        AdminRecord::Acs(acs) => {
            disposition
                .events
                .push(DaemonEvent::AggregateCustodySignal { acs });
        }
        AdminRecord::Announce(body) => {
            debug!(len = body.len(), "announce received");
        }
        AdminRecord::MulticastPetition(body) => {
            debug!(len = body.len(), "multicast petition received");
        }
        AdminRecord::Bibe(_) => {
            warn!("BIBE admin record received but BIBE is not enabled");
        }
    }
    Ok(disposition)
}

/// Echo the ping payload back to the source, truncated to the
/// configured max return length.
fn handle_ping(bundle: &BundleRef, ctx: &AdminContext<'_>) -> Result<AdminDisposition> {
    if bundle.source.is_null() {
        // anonymous pings cannot be answered
        return Ok(AdminDisposition::default());
    }
    let mut payload = bundle.payload.read_all()?;
    payload.truncate(ctx.ipn_echo_max_return_length as usize);

    let local_node = ctx
        .local_eid
        .node_number()
        .ok_or_else(|| DtnError::InvalidState("echo requires an ipn local EID".to_string()))?;
    let echo_source = EndpointId::ipn(local_node, ctx.ipn_echo_service_number);

    let reply = Bundle::builder(echo_source, bundle.source.clone())
        .bp_version(bundle.bp_version)
        .lifetime(bundle.lifetime)
        .payload(Payload::in_memory(payload))
        .build(ctx.id_source.next_id());

    debug!(dest = %reply.dest, bytes = reply.payload.len(), "echoing ping");
    Ok(AdminDisposition {
        events: Vec::new(),
        echo: Some(reply),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{
        dtn_time_now, CustodySignal, CustodySignalReason, StatusFlags, StatusReport,
        StatusReportReason,
    };

    fn ctx(generator: &BundleIdGenerator) -> AdminContext<'_> {
        AdminContext {
            local_eid: EndpointId::ipn(1, 0),
            ipn_echo_service_number: 2047,
            ipn_echo_max_return_length: 8,
            id_source: generator,
        }
    }

    #[test]
    fn test_custody_signal_routed_to_main() {
        let generator = BundleIdGenerator::new(100);
        let signal = CustodySignal {
            succeeded: true,
            reason: CustodySignalReason::NoAdditionalInfo,
            is_fragment: false,
            frag_offset: 0,
            frag_length: 0,
            signal_time: dtn_time_now(),
            creation_ts: crate::bundle::BundleTimestamp::new(1, 0),
            source: EndpointId::ipn(5, 1),
        };
        let bundle = Bundle::builder(EndpointId::ipn(5, 0), EndpointId::ipn(1, 0))
            .admin()
            .payload(Payload::in_memory(signal.encode()))
            .build(1);
        let disposition = handle_admin_bundle(&bundle, &ctx(&generator)).unwrap();
        assert_eq!(disposition.events.len(), 1);
        assert!(matches!(
            disposition.events[0],
            DaemonEvent::CustodySignalReceived { .. }
        ));
    }

    #[test]
    fn test_status_report_consumed() {
        let generator = BundleIdGenerator::new(100);
        let report = StatusReport {
            flags: StatusFlags::received(),
            reason: StatusReportReason::NoAdditionalInfo,
            is_fragment: false,
            frag_offset: 0,
            frag_length: 0,
            event_time: 1,
            creation_ts: crate::bundle::BundleTimestamp::new(1, 0),
            source: EndpointId::ipn(5, 1),
        };
        let bundle = Bundle::builder(EndpointId::ipn(5, 0), EndpointId::ipn(1, 0))
            .admin()
            .payload(Payload::in_memory(report.encode()))
            .build(1);
        let disposition = handle_admin_bundle(&bundle, &ctx(&generator)).unwrap();
        assert!(disposition.events.is_empty());
        assert!(disposition.echo.is_none());
    }

    #[test]
    fn test_ping_echoed_and_truncated() {
        let generator = BundleIdGenerator::new(100);
        let bundle = Bundle::builder(EndpointId::ipn(5, 99), EndpointId::ipn(1, 2047))
            .payload(Payload::in_memory(vec![7u8; 32]))
            .build(1);
        let disposition = handle_admin_bundle(&bundle, &ctx(&generator)).unwrap();
        let echo = disposition.echo.expect("echo bundle");
        assert_eq!(echo.dest, EndpointId::ipn(5, 99));
        assert_eq!(echo.source, EndpointId::ipn(1, 2047));
        assert_eq!(echo.payload.len(), 8);
    }

    #[test]
    fn test_anonymous_ping_dropped() {
        let generator = BundleIdGenerator::new(100);
        let bundle = Bundle::builder(EndpointId::null(), EndpointId::ipn(1, 2047))
            .payload(Payload::in_memory(vec![1u8; 4]))
            .build(1);
        let disposition = handle_admin_bundle(&bundle, &ctx(&generator)).unwrap();
        assert!(disposition.echo.is_none());
    }

    #[test]
    fn test_malformed_admin_payload_rejected() {
        let generator = BundleIdGenerator::new(100);
        let bundle = Bundle::builder(EndpointId::ipn(5, 0), EndpointId::ipn(1, 0))
            .admin()
            .payload(Payload::in_memory(vec![0xff, 0x00]))
            .build(1);
        assert!(handle_admin_bundle(&bundle, &ctx(&generator)).is_err());
    }
}
