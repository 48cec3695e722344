// LTP receiver node
//
// One thread per remote engine. Red data segments build the session's
// offset map; checkpoints solicit report segments; a contiguous red
// part plus end-of-block hands the assembled block to bundle
// extraction. Green segments are best-effort and deliver at EOB.
// Inactivity, report-retry exhaustion and quota pressure all cancel
// by receiver.

use crate::bundle::decode_bundle_frames;
use crate::ltp::segment::{CancelReason, SegBody, SegType, Segment};
use crate::ltp::session::{ReceiverSession, RedInsert, ReportInfo, SessionState};
use crate::ltp::LtpContext;
use crate::naming::EndpointId;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub enum ReceiverEvent {
    Segment(Segment),
    ReportTimeout { session_id: u64, report_serial: u64 },
    CancelTimeout { session_id: u64 },
    InactivityCheck { session_id: u64 },
    Shutdown,
}

pub struct ReceiverNode {
    ctx: Arc<LtpContext>,
    remote_engine: u64,
    link_name: String,
    events: Receiver<ReceiverEvent>,
    self_tx: Sender<ReceiverEvent>,
    sessions: HashMap<u64, ReceiverSession>,
}

pub fn run(
    ctx: Arc<LtpContext>,
    remote_engine: u64,
    link_name: String,
    events: Receiver<ReceiverEvent>,
    self_tx: Sender<ReceiverEvent>,
) {
    let mut node = ReceiverNode {
        ctx,
        remote_engine,
        link_name,
        events,
        self_tx,
        sessions: HashMap::new(),
    };
    info!(engine = node.remote_engine, "ltp receiver running");
    loop {
        match node.events.recv_timeout(Duration::from_millis(250)) {
            Ok(ReceiverEvent::Shutdown) => break,
            Ok(event) => node.handle_event(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!(engine = node.remote_engine, "ltp receiver exiting");
}

impl ReceiverNode {
    fn handle_event(&mut self, event: ReceiverEvent) {
        match event {
            ReceiverEvent::Segment(segment) => self.handle_segment(segment),
            ReceiverEvent::ReportTimeout {
                session_id,
                report_serial,
            } => self.handle_report_timeout(session_id, report_serial),
            ReceiverEvent::CancelTimeout { session_id } => self.handle_cancel_timeout(session_id),
            ReceiverEvent::InactivityCheck { session_id } => self.check_inactivity(session_id),
            ReceiverEvent::Shutdown => {}
        }
    }

    fn handle_segment(&mut self, segment: Segment) {
        let session_id = segment.session_id;
        match segment.seg_type {
            SegType::RedData { .. } | SegType::GreenData { .. } => self.handle_data(segment),
            SegType::ReportAck => {
                if let SegBody::ReportAck { report_serial } = segment.body {
                    self.handle_report_ack(session_id, report_serial);
                }
            }
            SegType::CancelBySender => {
                if let SegBody::Cancel { reason } = segment.body {
                    self.handle_cancel_by_sender(session_id, reason);
                }
            }
            SegType::CancelAckByReceiver => {
                // ack of our own cancel; the session is already gone or
                // in cancel state
                if let Some(mut session) = self.sessions.remove(&session_id) {
                    session.cancel_timers();
                    self.release_backlog(&session);
                    self.ctx.close_session(session_id, self.remote_engine);
                }
            }
            other => {
                debug!(session = session_id, "receiver ignoring {:?}", other);
            }
        }
    }

    // --------------------------------------------------------------- data

    fn handle_data(&mut self, segment: Segment) {
        let session_id = segment.session_id;
        let SegBody::Data {
            offset,
            checkpoint,
            payload,
            ..
        } = segment.body
        else {
            return;
        };
        let green = matches!(segment.seg_type, SegType::GreenData { .. });
        let (eorp, eob) = match segment.seg_type {
            SegType::RedData { eorp, eob, .. } => (eorp, eob),
            SegType::GreenData { eob } => (false, eob),
            _ => (false, false),
        };

        if self.ctx.is_closed(self.remote_engine, session_id) {
            // late segment for a closed session; nothing to rebuild
            self.ctx.stats.bump_dup_ds();
            return;
        }

        // red backlog quota: drop rather than block, retransmission
        // will bring the segment back
        if !green {
            let backlog = self.ctx.stats.red_backlog();
            if backlog + payload.len() as u64 > self.ctx.config.queued_bytes_quota {
                warn!(
                    session = session_id,
                    backlog, "queued-bytes quota exceeded, dropping red DS"
                );
                self.ctx.stats.bump_quota_drops();
                return;
            }
        }

        let mixed = {
            let session = self
                .sessions
                .entry(session_id)
                .or_insert_with(|| ReceiverSession::new(self.remote_engine, session_id));
            session.touch();
            if session.inactivity_timer.is_none() {
                Self::arm_inactivity(&self.ctx, &self.self_tx, session);
            }
            if green {
                session.saw_green = true;
            } else {
                session.saw_red = true;
            }
            // CCSDS-compatible sessions never mix colors
            self.ctx.config.ccsds_compatible && session.saw_red && session.saw_green
        };
        if mixed {
            warn!(session = session_id, "red/green mix, cancelling session");
            self.start_cancel(session_id, CancelReason::Miscolored);
            return;
        }

        if green {
            self.handle_green(session_id, offset, payload, eob);
            return;
        }

        let len = payload.len() as u64;
        match self
            .sessions
            .get_mut(&session_id)
            .expect("session just ensured")
            .insert_red(offset, payload)
        {
            RedInsert::New => {
                self.ctx.stats.add_red_backlog(len);
            }
            RedInsert::Duplicate => {
                self.ctx.stats.bump_dup_ds();
                // a duplicated checkpoint regenerates its report
                if let Some((checkpoint_id, _)) = checkpoint {
                    self.generate_report(session_id, checkpoint_id, offset + len);
                }
                return;
            }
            RedInsert::Overlap => {
                warn!(session = session_id, offset, "impossible DS overlap");
                self.start_cancel(session_id, CancelReason::SystemCancelled);
                return;
            }
        }

        {
            let session = self.sessions.get_mut(&session_id).expect("present");
            if eorp {
                session.expected = Some(offset + len);
            }
            if eob {
                session.eob_seen = true;
            }
        }

        if let Some((checkpoint_id, _)) = checkpoint {
            self.generate_report(session_id, checkpoint_id, offset + len);
        }

        let complete = self
            .sessions
            .get(&session_id)
            .map(|s| s.red_complete() && !s.delivered)
            .unwrap_or(false);
        if complete {
            self.deliver_red(session_id);
        }
    }

    fn handle_green(&mut self, session_id: u64, offset: u64, payload: Vec<u8>, eob: bool) {
        let finished = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            let len = payload.len() as u64;
            session.green_bytes += len;
            let _ = session.insert_red(offset, payload);
            if eob {
                session.expected = Some(offset + len);
                session.eob_seen = true;
                Some((session.assemble_red(), session.red_complete()))
            } else {
                None
            }
        };
        let Some((data, whole)) = finished else {
            return;
        };
        if let Some(mut session) = self.sessions.remove(&session_id) {
            session.cancel_timers();
        }
        self.ctx.close_session(session_id, self.remote_engine);
        if whole {
            self.extract_bundles(&data);
        } else {
            // best-effort: an incomplete green block is discarded
            debug!(session = session_id, "green block incomplete, dropped");
        }
    }

    // ------------------------------------------------------------ reports

    /// Build and send the report a checkpoint solicited.
    fn generate_report(&mut self, session_id: u64, checkpoint_id: u64, upper_bound: u64) {
        let segment = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            let claims = session.claims(upper_bound);
            if claims.is_empty() {
                return;
            }
            let serial = session.take_report_serial();
            let segment = Segment::report(
                self.remote_engine,
                session_id,
                serial,
                checkpoint_id,
                0,
                upper_bound,
                claims,
            );
            session.state = SessionState::Rs;
            session.reports.insert(
                serial,
                ReportInfo {
                    segment: segment.clone(),
                    retries: 0,
                    timer: None,
                },
            );
            segment
        };
        self.ctx.stats.bump_rs_generated();
        self.send(&segment);
        if let SegBody::Report { report_serial, .. } = segment.body {
            self.arm_report_timer(session_id, report_serial);
        }
    }

    fn arm_report_timer(&mut self, session_id: u64, report_serial: u64) {
        let tx = self.self_tx.clone();
        let token = self.ctx.timers.schedule_after(
            Duration::from_secs(u64::from(self.ctx.config.retran_intvl)),
            move || {
                let _ = tx.send(ReceiverEvent::ReportTimeout {
                    session_id,
                    report_serial,
                });
            },
        );
        if let Some(session) = self.sessions.get_mut(&session_id) {
            if let Some(report) = session.reports.get_mut(&report_serial) {
                if let Some(old) = report.timer.replace(token) {
                    old.cancel();
                }
            }
        }
    }

    fn handle_report_timeout(&mut self, session_id: u64, report_serial: u64) {
        let resend = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            if session.state == SessionState::Cs {
                return;
            }
            let Some(report) = session.reports.get_mut(&report_serial) else {
                return;
            };
            report.retries += 1;
            if report.retries > self.ctx.config.retran_retries {
                None
            } else {
                Some(report.segment.clone())
            }
        };
        match resend {
            Some(segment) => {
                self.send(&segment);
                self.arm_report_timer(session_id, report_serial);
            }
            None => {
                warn!(session = session_id, "report retries exhausted");
                self.start_cancel(session_id, CancelReason::RetransLimitExceeded);
            }
        }
    }

    fn handle_report_ack(&mut self, session_id: u64, report_serial: u64) {
        let close = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            session.touch();
            if let Some(mut report) = session.reports.remove(&report_serial) {
                if let Some(timer) = report.timer.take() {
                    timer.cancel();
                }
            }
            session.ra_received = true;
            session.delivered && session.reports.is_empty()
        };
        if close {
            self.close_delivered(session_id);
        }
    }

    // ----------------------------------------------------------- delivery

    fn deliver_red(&mut self, session_id: u64) {
        let data = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            session.delivered = true;
            session.assemble_red()
        };
        self.ctx.stats.sub_red_backlog(data.len() as u64);
        self.extract_bundles(&data);
        // the session stays open until the final report is acked
        let close = self
            .sessions
            .get(&session_id)
            .map(|s| s.ra_received && s.reports.is_empty())
            .unwrap_or(false);
        if close {
            self.close_delivered(session_id);
        }
    }

    fn extract_bundles(&self, data: &[u8]) {
        match decode_bundle_frames(data) {
            Ok(bundles) => {
                for bundle in bundles {
                    self.ctx.stats.bump_bundles_extracted();
                    self.ctx
                        .sink
                        .bundle_received(bundle, &self.link_name, EndpointId::Null);
                }
            }
            Err(e) => {
                warn!("bundle extraction failed: {}", e);
            }
        }
    }

    fn close_delivered(&mut self, session_id: u64) {
        if let Some(mut session) = self.sessions.remove(&session_id) {
            session.cancel_timers();
            self.ctx.stats.bump_receiver_completed();
            self.ctx.close_session(session_id, self.remote_engine);
            debug!(session = session_id, "receive session closed");
        }
    }

    // ------------------------------------------------------- cancellation

    fn handle_cancel_by_sender(&mut self, session_id: u64, reason: CancelReason) {
        // ack even when the session is unknown; cancels are idempotent
        self.send(&Segment::cancel_ack(self.remote_engine, session_id, true));
        if let Some(mut session) = self.sessions.remove(&session_id) {
            session.cancel_timers();
            info!(session = session_id, ?reason, "session cancelled by sender");
            if session.delivered {
                // delivery stands; the peer cancelled after we got it
                self.ctx.stats.bump_cancelled_but_got_bundles();
            } else {
                self.release_backlog(&session);
            }
            self.ctx.close_session(session_id, self.remote_engine);
        }
    }

    fn start_cancel(&mut self, session_id: u64, reason: CancelReason) {
        {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            session.state = SessionState::Cs;
            session.cancel_retries = 0;
            for report in session.reports.values_mut() {
                if let Some(timer) = report.timer.take() {
                    timer.cancel();
                }
            }
        }
        self.ctx.stats.bump_cancel_by_receiver();
        self.send_cancel(session_id, reason);
    }

    fn send_cancel(&mut self, session_id: u64, reason: CancelReason) {
        self.send(&Segment::cancel(
            self.remote_engine,
            session_id,
            false,
            reason,
        ));
        let tx = self.self_tx.clone();
        let token = self.ctx.timers.schedule_after(
            Duration::from_secs(u64::from(self.ctx.config.retran_intvl)),
            move || {
                let _ = tx.send(ReceiverEvent::CancelTimeout { session_id });
            },
        );
        if let Some(session) = self.sessions.get_mut(&session_id) {
            if let Some(old) = session.cancel_timer.replace(token) {
                old.cancel();
            }
        }
    }

    fn handle_cancel_timeout(&mut self, session_id: u64) {
        let exhausted = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            session.cancel_retries += 1;
            session.cancel_retries > self.ctx.config.retran_retries
        };
        if exhausted {
            if let Some(mut session) = self.sessions.remove(&session_id) {
                session.cancel_timers();
                self.release_backlog(&session);
                self.ctx.close_session(session_id, self.remote_engine);
            }
        } else {
            self.send_cancel(session_id, CancelReason::RetransCycleExceeded);
        }
    }

    // --------------------------------------------------------- inactivity

    fn arm_inactivity(ctx: &Arc<LtpContext>, tx: &Sender<ReceiverEvent>, session: &mut ReceiverSession) {
        let session_id = session.session_id;
        let tx = tx.clone();
        let token = ctx.timers.schedule_after(
            Duration::from_secs(u64::from(ctx.config.inactivity_intvl)),
            move || {
                let _ = tx.send(ReceiverEvent::InactivityCheck { session_id });
            },
        );
        session.inactivity_timer = Some(token);
    }

    fn check_inactivity(&mut self, session_id: u64) {
        let intvl = Duration::from_secs(u64::from(self.ctx.config.inactivity_intvl));
        let verdict = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            let idle = session.last_activity.elapsed();
            if idle < intvl {
                // activity since arming; re-check at the residual
                session.inactivity_timer = None;
                Some(intvl - idle)
            } else {
                None
            }
        };
        match verdict {
            Some(residual) => {
                let tx = self.self_tx.clone();
                let token = self.ctx.timers.schedule_after(residual, move || {
                    let _ = tx.send(ReceiverEvent::InactivityCheck { session_id });
                });
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.inactivity_timer = Some(token);
                }
            }
            None => {
                let delivered = self
                    .sessions
                    .get(&session_id)
                    .map(|s| s.delivered)
                    .unwrap_or(false);
                if delivered {
                    // the block made it out; only the report ack is
                    // missing, so close quietly
                    self.ctx.stats.bump_ras_not_received();
                    self.close_delivered(session_id);
                } else {
                    info!(session = session_id, "inactivity limit, cancelling");
                    self.start_cancel(session_id, CancelReason::RetransCycleExceeded);
                }
            }
        }
    }

    // ------------------------------------------------------------ helpers

    fn release_backlog(&self, session: &ReceiverSession) {
        if !session.delivered {
            self.ctx.stats.sub_red_backlog(session.red_bytes);
        }
    }

    fn send(&self, segment: &Segment) {
        if let Err(e) = self
            .ctx
            .segment_sender
            .send_segment(&self.link_name, &segment.encode())
        {
            warn!(link = %self.link_name, "segment send failed: {}", e);
        }
    }
}
