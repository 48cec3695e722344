// Restage convergence layer
//
// Writes whole bundles to uniquely named files under a quota-subject
// directory tree, reloads them into the daemon when BARD approves, and
// garbage-collects by retention age and bundle expiration. Disk usage
// is accounted in 512-byte blocks. State transitions (mount loss,
// quota exhaustion, IO errors, rescans) go out by email when enabled.

pub mod bard;
pub mod filename;

pub use bard::{Bard, Quota, QuotaKind, QuotaSubject, ReloadDecision};
pub use filename::{format_bundle_filename, format_dirname, parse_bundle_filename, BundleFileDesc};

use crate::bundle::store::BundleIdGenerator;
use crate::bundle::{
    decode_bundle_frames, dtn_time_now, encode_bundle_frame, Bundle, BundleRef, Payload,
};
use crate::cl::{ClEventSink, ClOptions, ConvergenceLayer};
use crate::config::RestageConfig;
use crate::contacts::LinkRef;
use crate::error::{DtnError, Result};
use crate::naming::EndpointId;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

const BLOCK_SIZE: u64 = 512;
const GC_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestageState {
    Online,
    Full,
    Error,
    Deleted,
}

#[derive(Debug, Default, Clone)]
pub struct DirStats {
    pub files: u64,
    pub bytes: u64,
    pub blocks: u64,
}

#[derive(Default)]
pub struct RestageStats {
    pub total_restaged: AtomicU64,
    pub total_reloaded: AtomicU64,
    pub total_deleted: AtomicU64,
    pub parse_failures: AtomicU64,
    pub disk_quota_in_use: AtomicU64,
}

struct EmailJob {
    subject: String,
    body: String,
}

/// On-disk storage controller: directory map, quota accounting, state.
pub struct ExternalStorageController {
    root: PathBuf,
    config: RestageConfig,
    link_name: String,
    bard: Arc<Bard>,
    id_source: Arc<BundleIdGenerator>,
    dirs: Mutex<HashMap<String, DirStats>>,
    state: Mutex<RestageState>,
    pub stats: RestageStats,
    email_tx: Mutex<Option<Sender<EmailJob>>>,
}

impl ExternalStorageController {
    pub fn new(
        root: PathBuf,
        config: RestageConfig,
        link_name: &str,
        bard: Arc<Bard>,
        id_source: Arc<BundleIdGenerator>,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&root)?;
        let controller = Self {
            root,
            config,
            link_name: link_name.to_string(),
            bard,
            id_source,
            dirs: Mutex::new(HashMap::new()),
            state: Mutex::new(RestageState::Online),
            stats: RestageStats::default(),
            email_tx: Mutex::new(None),
        };
        controller.rescan()?;
        Ok(controller)
    }

    pub fn state(&self) -> RestageState {
        *self.state.lock()
    }

    fn transition(&self, next: RestageState, detail: &str) {
        let mut state = self.state.lock();
        if *state == next {
            return;
        }
        let previous = *state;
        *state = next;
        drop(state);
        warn!(
            link = %self.link_name,
            from = ?previous,
            to = ?next,
            detail,
            "restage state transition"
        );
        self.send_email(
            &format!("restage {} now {:?}", self.link_name, next),
            &format!(
                "restage instance {} transitioned {:?} -> {:?}\n{}\n",
                self.link_name, previous, next, detail
            ),
        );
    }

    /// Walk the tree, parse every filename, rebuild the stats map.
    /// Unparseable files stay in place and are skipped.
    pub fn rescan(&self) -> Result<()> {
        if self.config.mount_point && !self.root.exists() {
            self.transition(RestageState::Error, "mount point missing");
            return Err(DtnError::Unavailable(format!(
                "restage mount {} missing",
                self.root.display()
            )));
        }
        let mut dirs = HashMap::new();
        let mut total_blocks = 0u64;
        for entry in fs::read_dir(&self.root)? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            let Some(dirname) = dir.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if !dirname.starts_with("src_") && !dirname.starts_with("dst_") {
                continue;
            }
            let mut stats = DirStats::default();
            for file in fs::read_dir(&dir)? {
                let file = file?.path();
                let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                match parse_bundle_filename(
                    name,
                    self.config.field_separator,
                    self.config.eid_field_separator,
                ) {
                    Ok(_) => {
                        let size = fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
                        let blocks = size.div_ceil(BLOCK_SIZE);
                        stats.files += 1;
                        stats.bytes += size;
                        stats.blocks += blocks;
                        total_blocks += blocks;
                    }
                    Err(e) => {
                        self.stats.parse_failures.fetch_add(1, Ordering::Relaxed);
                        debug!(file = name, "unparseable restage file: {}", e);
                    }
                }
            }
            dirs.insert(dirname, stats);
        }
        *self.dirs.lock() = dirs;
        self.stats
            .disk_quota_in_use
            .store(total_blocks * BLOCK_SIZE, Ordering::Relaxed);
        self.transition(RestageState::Online, "rescan complete");
        Ok(())
    }

    /// Serialize one bundle into its quota-subject directory.
    pub fn restage(&self, bundle: &BundleRef) -> Result<()> {
        match self.state() {
            RestageState::Online => {}
            RestageState::Full => {
                return Err(DtnError::QuotaExceeded("restage storage full".to_string()))
            }
            other => {
                return Err(DtnError::Unavailable(format!(
                    "restage state {:?}",
                    other
                )))
            }
        }
        if self.config.mount_point && !self.root.exists() {
            self.transition(RestageState::Error, "mount point missing");
            return Err(DtnError::Unavailable("restage mount missing".to_string()));
        }

        let by_dst = bundle.dest.node_number().is_some();
        let subject_eid = if by_dst { &bundle.dest } else { &bundle.source };
        let dirname = format_dirname(by_dst, subject_eid, self.config.eid_field_separator);
        let desc = BundleFileDesc::for_bundle(bundle);
        let name = format_bundle_filename(
            &desc,
            self.config.field_separator,
            self.config.eid_field_separator,
        );
        let dir = self.root.join(&dirname);
        fs::create_dir_all(&dir)?;
        let path = dir.join(&name);
        let data = encode_bundle_frame(bundle)?;

        if let Err(e) = fs::write(&path, &data) {
            if e.raw_os_error() == Some(libc_enospc()) {
                self.transition(RestageState::Full, "ENOSPC writing bundle file");
                return Err(DtnError::QuotaExceeded("disk full".to_string()));
            }
            self.transition(RestageState::Error, &format!("write failed: {}", e));
            return Err(e.into());
        }

        let blocks = (data.len() as u64).div_ceil(BLOCK_SIZE);
        {
            let mut dirs = self.dirs.lock();
            let stats = dirs.entry(dirname).or_default();
            stats.files += 1;
            stats.bytes += data.len() as u64;
            stats.blocks += blocks;
        }
        let in_use = self
            .stats
            .disk_quota_in_use
            .fetch_add(blocks * BLOCK_SIZE, Ordering::Relaxed)
            + blocks * BLOCK_SIZE;
        self.stats.total_restaged.fetch_add(1, Ordering::Relaxed);
        if let Some(subject) = QuotaSubject::for_bundle_dst(&bundle.dest) {
            self.bard.add_external(&subject, data.len() as u64);
        }
        info!(file = %path.display(), "bundle restaged");

        if self.config.disk_quota > 0 && in_use >= self.config.disk_quota {
            self.transition(RestageState::Full, "disk quota reached");
        }
        Ok(())
    }

    /// Reload every approved file back into the daemon.
    pub fn reload_all(&self, sink: &Arc<dyn ClEventSink>) -> Result<u64> {
        let mut reloaded = 0;
        for (dirname, path, name) in self.walk_files()? {
            let desc = match parse_bundle_filename(
                &name,
                self.config.field_separator,
                self.config.eid_field_separator,
            ) {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            let decision = self.bard.should_reload(&desc);
            if !decision.accept {
                debug!(file = name, "reload deferred by quota");
                continue;
            }
            match self.reload_file(&path, &decision) {
                Ok(bundle) => {
                    self.remove_file(&dirname, &path)?;
                    self.stats.total_reloaded.fetch_add(1, Ordering::Relaxed);
                    if let Some(subject) = QuotaSubject::for_bundle_dst(&bundle.dest) {
                        self.bard.sub_external(&subject, desc.payload_len);
                    }
                    reloaded += 1;
                    sink.bundle_received(bundle, &self.link_name, EndpointId::Null);
                }
                Err(e) => {
                    warn!(file = name, "reload failed: {}", e);
                }
            }
        }
        if reloaded > 0 {
            info!(count = reloaded, "bundles reloaded from restage");
        }
        Ok(reloaded)
    }

    fn reload_file(&self, path: &PathBuf, decision: &ReloadDecision) -> Result<BundleRef> {
        let data = fs::read(path)?;
        let mut bundles = decode_bundle_frames(&data)?;
        let bundle = bundles
            .pop()
            .ok_or_else(|| DtnError::Storage("empty restage file".to_string()))?;

        let mut meta = bundle.meta();
        meta.id = self.id_source.next_id();
        if let Some(dest) = &decision.new_dest {
            meta.dest = dest.clone();
        }
        // guarantee the minimum remaining TTL
        if decision.ttl_override > 0 {
            let now = dtn_time_now();
            let age = now.saturating_sub(meta.creation_ts.secs(meta.bp_version));
            if meta.lifetime < age + decision.ttl_override {
                meta.lifetime = age + decision.ttl_override;
            }
        }
        let payload = Payload::in_memory(bundle.payload.read_all()?);
        Ok(Bundle::from_meta(meta, payload))
    }

    /// Hourly sweep: delete files past retention or past expiration.
    /// Unparseable files still honor mtime retention.
    pub fn gc(&self) -> Result<u64> {
        let retention = Duration::from_secs(u64::from(self.config.days_retention) * 86_400);
        let now_dtn = dtn_time_now();
        let mut deleted = 0;
        for (dirname, path, name) in self.walk_files()? {
            let too_old = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .map(|age| age >= retention)
                .unwrap_or(false);
            let expired = self.config.expire_bundles
                && parse_bundle_filename(
                    &name,
                    self.config.field_separator,
                    self.config.eid_field_separator,
                )
                .map(|desc| desc.exp_dtn_time <= now_dtn)
                .unwrap_or(false);
            if too_old || expired {
                self.remove_file(&dirname, &path)?;
                self.stats.total_deleted.fetch_add(1, Ordering::Relaxed);
                deleted += 1;
                debug!(file = name, too_old, expired, "restage file collected");
            }
        }
        Ok(deleted)
    }

    fn walk_files(&self) -> Result<Vec<(String, PathBuf, String)>> {
        let mut files = Vec::new();
        if !self.root.exists() {
            if self.config.mount_point {
                self.transition(RestageState::Error, "mount point missing");
            }
            return Ok(files);
        }
        for entry in fs::read_dir(&self.root)? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            let Some(dirname) = dir.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            for file in fs::read_dir(&dir)? {
                let path = file?.path();
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    files.push((dirname.clone(), path.clone(), name.to_string()));
                }
            }
        }
        Ok(files)
    }

    fn remove_file(&self, dirname: &str, path: &PathBuf) -> Result<()> {
        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let blocks = size.div_ceil(BLOCK_SIZE);
        fs::remove_file(path)?;
        let mut dirs = self.dirs.lock();
        if let Some(stats) = dirs.get_mut(dirname) {
            stats.files = stats.files.saturating_sub(1);
            stats.bytes = stats.bytes.saturating_sub(size);
            stats.blocks = stats.blocks.saturating_sub(blocks);
        }
        drop(dirs);
        let freed = blocks * BLOCK_SIZE;
        let mut current = self.stats.disk_quota_in_use.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(freed);
            match self.stats.disk_quota_in_use.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        // freeing space can clear a FULL condition
        if self.state() == RestageState::Full {
            let in_use = self.stats.disk_quota_in_use.load(Ordering::Relaxed);
            if self.config.disk_quota == 0 || in_use < self.config.disk_quota {
                self.transition(RestageState::Online, "space reclaimed");
            }
        }
        Ok(())
    }

    pub fn dir_stats(&self) -> HashMap<String, DirStats> {
        self.dirs.lock().clone()
    }

    fn attach_emailer(&self, tx: Sender<EmailJob>) {
        *self.email_tx.lock() = Some(tx);
    }

    fn send_email(&self, subject: &str, body: &str) {
        if !self.config.email_enabled {
            return;
        }
        if let Some(tx) = self.email_tx.lock().clone() {
            let _ = tx.send(EmailJob {
                subject: subject.to_string(),
                body: body.to_string(),
            });
        }
    }
}

fn libc_enospc() -> i32 {
    28
}

/// Pipe a notification through the system MTA.
fn run_emailer(config: RestageConfig, rx: Receiver<EmailJob>) {
    while let Ok(job) = rx.recv() {
        for to in &config.notify_emails {
            let mut message = String::new();
            message.push_str(&format!("To: {}\n", to));
            if !config.from_email.is_empty() {
                message.push_str(&format!("From: {}\n", config.from_email));
            }
            message.push_str(&format!("Subject: {}\n\n{}\n", job.subject, job.body));
            let spawned = Command::new("/usr/sbin/sendmail")
                .arg("-t")
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
            match spawned {
                Ok(mut child) => {
                    if let Some(stdin) = child.stdin.as_mut() {
                        let _ = stdin.write_all(message.as_bytes());
                    }
                    let _ = child.wait();
                }
                Err(e) => {
                    error!("sendmail spawn failed: {}", e);
                }
            }
        }
    }
}

enum RestagerJob {
    Restage(LinkRef, BundleRef),
    Reload,
    Shutdown,
}

/// The convergence layer wrapping the controller with its worker
/// threads: a restager, a reloader/GC loop, and an emailer.
pub struct RestageConvergenceLayer {
    controller: Arc<ExternalStorageController>,
    sink: Mutex<Option<Arc<dyn ClEventSink>>>,
    jobs_tx: Sender<RestagerJob>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl RestageConvergenceLayer {
    pub fn new(
        root: PathBuf,
        config: RestageConfig,
        link_name: &str,
        bard: Arc<Bard>,
        id_source: Arc<BundleIdGenerator>,
        sink: Arc<dyn ClEventSink>,
    ) -> Result<Self> {
        let controller = Arc::new(ExternalStorageController::new(
            root,
            config.clone(),
            link_name,
            bard,
            id_source,
        )?);
        let (jobs_tx, jobs_rx) = unbounded();
        let mut threads = Vec::new();

        if config.email_enabled {
            let (email_tx, email_rx) = unbounded();
            controller.attach_emailer(email_tx);
            let email_config = config.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("restage-email".to_string())
                    .spawn(move || run_emailer(email_config, email_rx))
                    .expect("spawn emailer"),
            );
        }

        let worker_controller = controller.clone();
        let worker_sink = sink.clone();
        let auto_reload = config.auto_reload_interval;
        threads.push(
            std::thread::Builder::new()
                .name("restage-worker".to_string())
                .spawn(move || {
                    run_restager(worker_controller, worker_sink, jobs_rx, auto_reload)
                })
                .expect("spawn restager"),
        );

        Ok(Self {
            controller,
            sink: Mutex::new(Some(sink)),
            jobs_tx,
            threads: Mutex::new(threads),
        })
    }

    pub fn controller(&self) -> &Arc<ExternalStorageController> {
        &self.controller
    }

    /// Kick an explicit reload pass.
    pub fn trigger_reload(&self) {
        let _ = self.jobs_tx.send(RestagerJob::Reload);
    }
}

fn run_restager(
    controller: Arc<ExternalStorageController>,
    sink: Arc<dyn ClEventSink>,
    jobs: Receiver<RestagerJob>,
    auto_reload_secs: u64,
) {
    info!("restage worker running");
    let mut last_gc = Instant::now();
    let mut last_reload = Instant::now();
    loop {
        match jobs.recv_timeout(Duration::from_secs(1)) {
            Ok(RestagerJob::Shutdown) => break,
            Ok(RestagerJob::Restage(link, bundle)) => {
                let bytes = bundle.payload.len();
                match controller.restage(&bundle) {
                    Ok(()) => {
                        sink.bundle_transmitted(bundle, &link.name, bytes, true, true);
                    }
                    Err(e) => {
                        warn!(link = %link.name, "restage refused: {}", e);
                        sink.bundle_transmitted(bundle, &link.name, 0, true, false);
                    }
                }
            }
            Ok(RestagerJob::Reload) => {
                if let Err(e) = controller.reload_all(&sink) {
                    warn!("reload pass failed: {}", e);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if auto_reload_secs > 0 && last_reload.elapsed() >= Duration::from_secs(auto_reload_secs) {
            last_reload = Instant::now();
            if let Err(e) = controller.reload_all(&sink) {
                warn!("auto reload failed: {}", e);
            }
        }
        if last_gc.elapsed() >= GC_INTERVAL {
            last_gc = Instant::now();
            if let Err(e) = controller.gc() {
                warn!("restage gc failed: {}", e);
            }
        }
    }
    info!("restage worker exiting");
}

impl ConvergenceLayer for RestageConvergenceLayer {
    fn name(&self) -> &'static str {
        "restage"
    }

    fn interface_up(&self, _interface: &str, _options: &ClOptions) -> Result<()> {
        Ok(())
    }

    fn interface_down(&self, _interface: &str) -> Result<()> {
        Ok(())
    }

    fn init_link(&self, _link: &LinkRef, _options: &ClOptions) -> Result<()> {
        Ok(())
    }

    fn delete_link(&self, _link: &LinkRef) -> Result<()> {
        Ok(())
    }

    fn dump_link(&self, link: &LinkRef) -> String {
        let stats = self.controller.dir_stats();
        let files: u64 = stats.values().map(|s| s.files).sum();
        format!(
            "restage link {} state {:?} files {} quota_in_use {}",
            link.name,
            self.controller.state(),
            files,
            self.controller
                .stats
                .disk_quota_in_use
                .load(Ordering::Relaxed)
        )
    }

    fn open_contact(&self, link: &LinkRef) -> Result<()> {
        link.open_contact()?;
        if let Some(sink) = self.sink.lock().clone() {
            sink.contact_up(&link.name);
        }
        Ok(())
    }

    fn close_contact(&self, link: &LinkRef) -> Result<()> {
        link.close_contact();
        Ok(())
    }

    fn bundle_queued(&self, link: &LinkRef, _bundle: &BundleRef) -> Result<()> {
        while let Some(bundle) = link.pop_queued() {
            self.jobs_tx
                .send(RestagerJob::Restage(link.clone(), bundle))
                .map_err(|_| DtnError::Unavailable("restage worker stopped".to_string()))?;
        }
        Ok(())
    }

    fn ready_for_bundles(&self, _link: &LinkRef) -> bool {
        self.controller.state() == RestageState::Online
    }

    fn list_link_opts(&self) -> Vec<&'static str> {
        vec![
            "mount_point",
            "days_retention",
            "expire_bundles",
            "ttl_override",
            "auto_reload_interval",
            "disk_quota",
            "part_of_pool",
            "email_enabled",
            "field_separator",
            "eid_field_separator",
        ]
    }

    fn shutdown(&self) {
        let _ = self.jobs_tx.send(RestagerJob::Shutdown);
        *self.sink.lock() = None;
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::LinkState;

    fn controller(dir: &std::path::Path, config: RestageConfig) -> ExternalStorageController {
        ExternalStorageController::new(
            dir.to_path_buf(),
            config,
            "restage0",
            Arc::new(Bard::new(86_400)),
            Arc::new(BundleIdGenerator::new(1000)),
        )
        .unwrap()
    }

    fn test_bundle(ttl: u64) -> BundleRef {
        Bundle::builder(EndpointId::ipn(5, 1), EndpointId::ipn(9, 2))
            .creation_ts(dtn_time_now(), 0)
            .lifetime(ttl)
            .payload(Payload::in_memory(vec![7u8; 2048]))
            .build(1)
    }

    #[test]
    fn test_restage_creates_named_file_and_accounts_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), RestageConfig::default());
        controller.restage(&test_bundle(3600)).unwrap();

        let subdir = dir.path().join("dst_ipn-9");
        let files: Vec<_> = fs::read_dir(&subdir).unwrap().collect();
        assert_eq!(files.len(), 1);
        let name = files[0].as_ref().unwrap().file_name();
        let name = name.to_str().unwrap();
        assert!(name.starts_with("src_ipn-5-1_dst_ipn-9-2_bts_"));
        let desc = parse_bundle_filename(name, '_', '-').unwrap();
        assert_eq!(desc.payload_len, 2048);

        let size = fs::metadata(files[0].as_ref().unwrap().path()).unwrap().len();
        let expected = size.div_ceil(512) * 512;
        assert_eq!(
            controller.stats.disk_quota_in_use.load(Ordering::Relaxed),
            expected
        );
        assert_eq!(controller.stats.total_restaged.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_reload_extends_ttl_and_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RestageConfig::default();
        config.ttl_override = 86_400;
        let controller = ExternalStorageController::new(
            dir.path().to_path_buf(),
            config,
            "restage0",
            Arc::new(Bard::new(86_400)),
            Arc::new(BundleIdGenerator::new(1000)),
        )
        .unwrap();

        // one hour of remaining TTL on the way in
        controller.restage(&test_bundle(3600)).unwrap();

        struct Capture(Mutex<Vec<BundleRef>>);
        impl ClEventSink for Capture {
            fn bundle_received(&self, b: BundleRef, _l: &str, _p: EndpointId) {
                self.0.lock().push(b);
            }
            fn bundle_transmitted(&self, _b: BundleRef, _l: &str, _by: u64, _r: bool, _s: bool) {}
            fn contact_up(&self, _l: &str) {}
            fn contact_down(&self, _l: &str, _r: &str) {}
            fn link_state_change(&self, _l: &str, _s: LinkState, _r: &str) {}
            fn ready_for_bundles(&self, _l: &str) {}
        }
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        let sink: Arc<dyn ClEventSink> = capture.clone();
        assert_eq!(controller.reload_all(&sink).unwrap(), 1);
        assert_eq!(controller.stats.total_reloaded.load(Ordering::Relaxed), 1);

        let reloaded = capture.0.lock();
        assert_eq!(reloaded.len(), 1);
        let ttl = reloaded[0].time_to_expiration().unwrap();
        assert!(ttl >= Duration::from_secs(86_000), "ttl {:?}", ttl);
        // fresh local id assigned on the way back in
        assert!(reloaded[0].id >= 1000);

        // file deleted and accounting zeroed
        let files: Vec<_> = fs::read_dir(dir.path().join("dst_ipn-9")).unwrap().collect();
        assert!(files.is_empty());
        assert_eq!(controller.stats.disk_quota_in_use.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_gc_honors_expiration() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), RestageConfig::default());
        // already expired on arrival
        let bundle = Bundle::builder(EndpointId::ipn(5, 1), EndpointId::ipn(9, 2))
            .creation_ts(dtn_time_now().saturating_sub(7200), 0)
            .lifetime(10)
            .payload(Payload::in_memory(vec![1u8; 64]))
            .build(2);
        controller.restage(&bundle).unwrap();
        assert_eq!(controller.gc().unwrap(), 1);
        assert_eq!(controller.stats.total_deleted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unparseable_files_survive_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let subdir = dir.path().join("dst_ipn-9");
        fs::create_dir_all(&subdir).unwrap();
        fs::write(subdir.join("garbage.bin"), b"not a bundle").unwrap();
        let controller = controller(dir.path(), RestageConfig::default());
        assert_eq!(controller.stats.parse_failures.load(Ordering::Relaxed), 1);
        assert!(subdir.join("garbage.bin").exists());
        // not counted toward quota
        assert_eq!(controller.stats.disk_quota_in_use.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_quota_exhaustion_goes_full() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RestageConfig::default();
        config.disk_quota = 1024;
        let controller = controller(dir.path(), config);
        controller.restage(&test_bundle(3600)).unwrap();
        assert_eq!(controller.state(), RestageState::Full);
        assert!(matches!(
            controller.restage(&test_bundle(3600)),
            Err(DtnError::QuotaExceeded(_))
        ));
    }
}
