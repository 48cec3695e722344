// LTP sender node
//
// One thread per remote engine. Bundles aggregate into the loading
// session until agg_size or agg_time closes it; the block is then cut
// into data segments, red traffic checkpointed and driven by inbound
// report segments until every byte is claimed. The wait is a single
// select over the event channel with the aggregation deadline as the
// timeout, so reconfiguration and queue activity wake it immediately.

use crate::bundle::BundleRef;
use crate::error::Result;
use crate::ltp::segment::{CancelReason, SegBody, SegType, Segment};
use crate::ltp::session::{SenderSession, SessionState, FILE_SPILL_THRESHOLD};
use crate::ltp::{LtpContext, TokenBucket};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// LTP client service id for bundle protocol traffic.
const CLIENT_SERVICE_BUNDLES: u64 = 1;

pub enum SenderEvent {
    BundleQueued(BundleRef),
    Segment(Segment),
    CheckpointTimeout {
        session_id: u64,
        checkpoint_id: u64,
    },
    CancelTimeout {
        session_id: u64,
    },
    Shutdown,
}

pub struct SenderNode {
    ctx: Arc<LtpContext>,
    remote_engine: u64,
    link_name: String,
    events: Receiver<SenderEvent>,
    self_tx: Sender<SenderEvent>,
    loading: Option<SenderSession>,
    loading_since: Option<Instant>,
    sessions: HashMap<u64, SenderSession>,
    bucket: TokenBucket,
}

pub fn run(
    ctx: Arc<LtpContext>,
    remote_engine: u64,
    link_name: String,
    events: Receiver<SenderEvent>,
    self_tx: Sender<SenderEvent>,
) {
    let bucket = TokenBucket::new(ctx.config.rate, ctx.config.bucket_depth);
    let mut node = SenderNode {
        ctx,
        remote_engine,
        link_name,
        events,
        self_tx,
        loading: None,
        loading_since: None,
        sessions: HashMap::new(),
        bucket,
    };
    info!(engine = node.remote_engine, "ltp sender running");
    node.event_loop();
    info!(engine = node.remote_engine, "ltp sender exiting");
}

impl SenderNode {
    fn event_loop(&mut self) {
        let agg_time = Duration::from_millis(self.ctx.config.agg_time_millis);
        loop {
            let timeout = match self.loading_since {
                Some(since) => agg_time
                    .checked_sub(since.elapsed())
                    .unwrap_or(Duration::ZERO),
                None => Duration::from_millis(250),
            };
            match self.events.recv_timeout(timeout) {
                Ok(SenderEvent::Shutdown) => return,
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
            // aggregation deadline applies whether woken or timed out
            if let Some(since) = self.loading_since {
                if since.elapsed() >= agg_time {
                    self.dispatch_loading();
                }
            }
        }
    }

    fn handle_event(&mut self, event: SenderEvent) {
        match event {
            SenderEvent::BundleQueued(bundle) => self.enqueue_bundle(bundle),
            SenderEvent::Segment(segment) => self.handle_segment(segment),
            SenderEvent::CheckpointTimeout {
                session_id,
                checkpoint_id,
            } => self.handle_checkpoint_timeout(session_id, checkpoint_id),
            SenderEvent::CancelTimeout { session_id } => self.handle_cancel_timeout(session_id),
            SenderEvent::Shutdown => {}
        }
    }

    // ------------------------------------------------------------ loading

    fn enqueue_bundle(&mut self, bundle: BundleRef) {
        let green = bundle.ecos_streaming;
        // CCSDS mode never mixes colors in one session
        if let Some(loading) = &self.loading {
            if loading.green != green {
                self.dispatch_loading();
            }
        }
        if self.sessions.len() >= self.ctx.config.max_sessions as usize {
            warn!(
                engine = self.remote_engine,
                "session limit reached, bundle stays queued on link"
            );
            self.ctx.sink.bundle_transmitted(
                bundle,
                &self.link_name,
                0,
                false,
                false,
            );
            return;
        }
        if self.loading.is_none() {
            let session_id = self.ctx.take_session_id(self.remote_engine);
            self.loading_since = Some(Instant::now());
            self.loading = Some(SenderSession::new(session_id, green));
        }
        let loading = self.loading.as_mut().expect("loading session present");
        if let Err(e) = loading.load_bundle(bundle) {
            warn!(engine = self.remote_engine, "bundle load failed: {}", e);
        }
        let full = loading.block_len() >= self.ctx.config.agg_size;
        if full {
            self.dispatch_loading();
        }
    }

    /// Close the loading session and emit its segments.
    fn dispatch_loading(&mut self) {
        let Some(mut session) = self.loading.take() else {
            self.loading_since = None;
            return;
        };
        self.loading_since = None;
        if session.data.is_empty() {
            return;
        }
        if self.ctx.config.use_files_xmit && session.block_len() >= FILE_SPILL_THRESHOLD {
            if let Err(e) = session
                .data
                .spill(&self.ctx.config.dir_path, session.session_id)
            {
                warn!("session spill failed: {}", e);
            }
        }
        debug!(
            engine = self.remote_engine,
            session = session.session_id,
            bytes = session.block_len(),
            green = session.green,
            "dispatching session"
        );
        if let Err(e) = self.send_block(&mut session) {
            warn!(session = session.session_id, "session send failed: {}", e);
        }
        if session.green {
            // best-effort traffic completes at wire time
            let bytes = session.block_len();
            for bundle in session.bundles.drain(..) {
                self.ctx
                    .sink
                    .bundle_transmitted(bundle, &self.link_name, bytes, false, true);
            }
            self.ctx.close_session(session.session_id, self.remote_engine);
            session.data.cleanup();
            return;
        }
        self.sessions.insert(session.session_id, session);
    }

    /// Segment the block: payloads of at most seg_size, checkpoints at
    /// the final segment and every bytes_per_checkpoint when set.
    fn send_block(&mut self, session: &mut SenderSession) -> Result<()> {
        let total = session.block_len();
        let seg_size = self.ctx.config.seg_size.max(1);
        let per_checkpoint = self.ctx.config.bytes_per_checkpoint;
        let mut offset = 0u64;
        let mut since_checkpoint = 0u64;
        while offset < total {
            let length = seg_size.min(total - offset);
            let payload = session.data.read_range(offset, length)?;
            let last = offset + length >= total;
            since_checkpoint += length;
            let make_checkpoint =
                !session.green && (last || (per_checkpoint > 0 && since_checkpoint >= per_checkpoint));
            let seg_type = if session.green {
                SegType::GreenData { eob: last }
            } else {
                SegType::RedData {
                    checkpoint: make_checkpoint,
                    eorp: last,
                    eob: last,
                }
            };
            let checkpoint = if make_checkpoint {
                since_checkpoint = 0;
                Some((session.take_checkpoint_id(), 0))
            } else {
                None
            };
            let segment = Segment::data(
                self.ctx.local_engine_id,
                session.session_id,
                CLIENT_SERVICE_BUNDLES,
                offset,
                payload,
                seg_type,
                checkpoint,
            );
            if !session.green {
                session.outstanding.insert(offset, length);
            }
            self.transmit(&segment);
            if let Some((checkpoint_id, _)) = checkpoint {
                self.arm_checkpoint(session, checkpoint_id, segment);
            }
            offset += length;
        }
        Ok(())
    }

    fn transmit(&mut self, segment: &Segment) {
        let encoded = segment.encode();
        self.bucket.consume(encoded.len() as u64 * 8);
        if let Err(e) = self
            .ctx
            .segment_sender
            .send_segment(&self.link_name, &encoded)
        {
            warn!(link = %self.link_name, "segment send failed: {}", e);
        }
    }

    fn arm_checkpoint(&self, session: &mut SenderSession, checkpoint_id: u64, segment: Segment) {
        let tx = self.self_tx.clone();
        let session_id = session.session_id;
        let token = self.ctx.timers.schedule_after(
            Duration::from_secs(u64::from(self.ctx.config.retran_intvl)),
            move || {
                let _ = tx.send(SenderEvent::CheckpointTimeout {
                    session_id,
                    checkpoint_id,
                });
            },
        );
        session.checkpoints.insert(
            checkpoint_id,
            crate::ltp::session::CheckpointInfo {
                checkpoint_id,
                segment,
                retries: 0,
                timer: Some(token),
            },
        );
    }

    // ------------------------------------------------------------ reports

    fn handle_segment(&mut self, segment: Segment) {
        match segment.seg_type {
            SegType::ReportSegment => self.handle_report(segment),
            SegType::CancelByReceiver => {
                // receiver cancelled our session
                let SegBody::Cancel { reason } = segment.body else {
                    return;
                };
                self.transmit(&Segment::cancel_ack(
                    self.ctx.local_engine_id,
                    segment.session_id,
                    false,
                ));
                self.fail_session(
                    segment.session_id,
                    &format!("cancelled by receiver: {:?}", reason),
                );
            }
            SegType::CancelAckByReceiver => {
                // our cancel completed
                self.fail_session(segment.session_id, "cancel acknowledged");
            }
            other => {
                debug!(session = segment.session_id, "sender ignoring {:?}", other);
            }
        }
    }

    fn handle_report(&mut self, segment: Segment) {
        let SegBody::Report {
            report_serial,
            checkpoint_id,
            lower_bound,
            upper_bound,
            claims,
        } = &segment.body
        else {
            return;
        };
        // a report is acked immediately, even for closed sessions
        self.transmit(&Segment::report_ack(
            self.ctx.local_engine_id,
            segment.session_id,
            *report_serial,
        ));
        let Some(session) = self.sessions.get_mut(&segment.session_id) else {
            debug!(
                session = segment.session_id,
                "late report for closed session"
            );
            return;
        };

        // the checkpoint the report answers is no longer outstanding
        if let Some(mut info) = session.checkpoints.remove(checkpoint_id) {
            if let Some(timer) = info.timer.take() {
                timer.cancel();
            }
        }
        for claim in claims {
            session.apply_claim(*lower_bound, claim);
        }

        let gaps = session.unclaimed_in(*lower_bound, *upper_bound);
        if gaps.is_empty() && session.fully_acked() {
            self.complete_session(segment.session_id);
            return;
        }
        if gaps.is_empty() {
            // nothing to resend inside this report's window
            return;
        }
        self.retransmit_gaps(segment.session_id, *report_serial, gaps);
    }

    /// Resend the unclaimed ranges; the final retransmitted segment is
    /// a fresh checkpoint tied to the report serial.
    fn retransmit_gaps(&mut self, session_id: u64, report_serial: u64, gaps: Vec<(u64, u64)>) {
        let seg_size = self.ctx.config.seg_size.max(1);
        let mut segments = Vec::new();
        {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            let last_index = gaps.len() - 1;
            for (i, (start, length)) in gaps.iter().enumerate() {
                let mut offset = *start;
                let end = start + length;
                while offset < end {
                    let chunk = seg_size.min(end - offset);
                    let payload = match session.data.read_range(offset, chunk) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(session = session_id, "retransmit read failed: {}", e);
                            return;
                        }
                    };
                    let is_final = i == last_index && offset + chunk >= end;
                    let checkpoint = if is_final {
                        Some((session.take_checkpoint_id(), report_serial))
                    } else {
                        None
                    };
                    let segment = Segment::data(
                        self.ctx.local_engine_id,
                        session_id,
                        CLIENT_SERVICE_BUNDLES,
                        offset,
                        payload,
                        SegType::RedData {
                            checkpoint: checkpoint.is_some(),
                            eorp: false,
                            eob: false,
                        },
                        checkpoint,
                    );
                    session.ds_resends += 1;
                    self.ctx.stats.bump_ds_resends();
                    segments.push((segment, checkpoint));
                    offset += chunk;
                }
            }
        }
        for (segment, checkpoint) in segments {
            self.transmit(&segment);
            if let Some((checkpoint_id, _)) = checkpoint {
                self.arm_checkpoint_by_id(session_id, checkpoint_id, segment);
            }
        }
    }

    fn arm_checkpoint_by_id(&mut self, session_id: u64, checkpoint_id: u64, segment: Segment) {
        let tx = self.self_tx.clone();
        let token = self.ctx.timers.schedule_after(
            Duration::from_secs(u64::from(self.ctx.config.retran_intvl)),
            move || {
                let _ = tx.send(SenderEvent::CheckpointTimeout {
                    session_id,
                    checkpoint_id,
                });
            },
        );
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.checkpoints.insert(
                checkpoint_id,
                crate::ltp::session::CheckpointInfo {
                    checkpoint_id,
                    segment,
                    retries: 0,
                    timer: Some(token),
                },
            );
        }
    }

    // ------------------------------------------------------------- timers

    fn handle_checkpoint_timeout(&mut self, session_id: u64, checkpoint_id: u64) {
        let retran_retries = self.ctx.config.retran_retries;
        let (resend, exhausted) = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            if session.state == SessionState::Cs {
                return;
            }
            let Some(info) = session.checkpoints.get_mut(&checkpoint_id) else {
                return;
            };
            info.retries += 1;
            if info.retries > retran_retries {
                (None, true)
            } else {
                session.ds_resends += 1;
                (Some(info.segment.clone()), false)
            }
        };
        if exhausted {
            warn!(
                session = session_id,
                checkpoint = checkpoint_id,
                "checkpoint retries exhausted, cancelling"
            );
            self.start_cancel(session_id, CancelReason::RetransLimitExceeded);
            return;
        }
        if let Some(segment) = resend {
            self.ctx.stats.bump_ds_resends();
            self.transmit(&segment);
            let tx = self.self_tx.clone();
            let token = self.ctx.timers.schedule_after(
                Duration::from_secs(u64::from(self.ctx.config.retran_intvl)),
                move || {
                    let _ = tx.send(SenderEvent::CheckpointTimeout {
                        session_id,
                        checkpoint_id,
                    });
                },
            );
            if let Some(session) = self.sessions.get_mut(&session_id) {
                if let Some(info) = session.checkpoints.get_mut(&checkpoint_id) {
                    if let Some(old) = info.timer.replace(token) {
                        old.cancel();
                    }
                }
            }
        }
    }

    fn start_cancel(&mut self, session_id: u64, reason: CancelReason) {
        {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            session.state = SessionState::Cs;
            session.cancel_timers();
            session.cancel_retries = 0;
        }
        self.ctx.stats.bump_cancel_by_sender();
        self.send_cancel(session_id, reason);
    }

    fn send_cancel(&mut self, session_id: u64, reason: CancelReason) {
        let segment = Segment::cancel(self.ctx.local_engine_id, session_id, true, reason);
        self.transmit(&segment);
        let tx = self.self_tx.clone();
        let token = self.ctx.timers.schedule_after(
            Duration::from_secs(u64::from(self.ctx.config.retran_intvl)),
            move || {
                let _ = tx.send(SenderEvent::CancelTimeout { session_id });
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
            self.fail_session(session_id, "cancel retries exhausted");
        } else {
            self.send_cancel(session_id, CancelReason::RetransLimitExceeded);
        }
    }

    // ------------------------------------------------------------ closure

    fn complete_session(&mut self, session_id: u64) {
        let Some(mut session) = self.sessions.remove(&session_id) else {
            return;
        };
        session.cancel_timers();
        let bytes = session.block_len();
        info!(
            engine = self.remote_engine,
            session = session_id,
            bytes,
            bundles = session.bundles.len(),
            "session complete"
        );
        self.ctx.stats.bump_sender_completed();
        for bundle in session.bundles.drain(..) {
            self.ctx
                .sink
                .bundle_transmitted(bundle, &self.link_name, bytes, true, true);
        }
        session.data.cleanup();
        self.ctx.close_session(session_id, self.remote_engine);
    }

    /// Close with failure: every bundle in the session failed.
    fn fail_session(&mut self, session_id: u64, why: &str) {
        let Some(mut session) = self.sessions.remove(&session_id) else {
            return;
        };
        session.cancel_timers();
        warn!(
            engine = self.remote_engine,
            session = session_id,
            "session failed: {}",
            why
        );
        for bundle in session.bundles.drain(..) {
            self.ctx
                .sink
                .bundle_transmitted(bundle, &self.link_name, 0, true, false);
        }
        session.data.cleanup();
        self.ctx.close_session(session_id, self.remote_engine);
    }
}
