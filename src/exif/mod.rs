//! Metadata write-back.
//!
//! Edits are recorded as [`ExifOperation`] rows. Once they have settled for
//! the debounce period they are conflated per image and written to the
//! file with exiftool in a single run.

pub mod conflate;
pub mod tool;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cache::ImageCache;
use crate::config::ExifConfig;
use crate::db::{
    exif_ops, images, Database, ExifOperation, ExifType, FaceRegion, OperationType, WriteState,
};
use crate::events::{Notification, Notifier};
use crate::indexing::RescanProvider;
use crate::work::{Job, JobPriority, JobSignal, JobSource};

pub use conflate::{conflate, Conflated};
pub use tool::{sanitize_text, ExifTool, ExifToolError, TagWriter};

/// Everything an [`ExifJob`] needs to write one image.
struct WriteBack {
    db: Database,
    writer: Arc<dyn TagWriter>,
    rescan: Arc<dyn RescanProvider>,
    cache: Arc<ImageCache>,
    notifier: Arc<dyn Notifier>,
}

impl WriteBack {
    /// Keep only operations that are still pending in the log. Conflation output that
    /// was never logged is kept as is.
    fn still_pending(&self, ops: Vec<ExifOperation>) -> Result<Vec<ExifOperation>> {
        let Some(image_id) = ops.first().map(|op| op.image_id) else {
            return Ok(ops);
        };
        let pending: Vec<i64> = exif_ops::for_image(&self.db.session(), image_id)?
            .into_iter()
            .filter(|op| op.state == WriteState::Pending)
            .filter_map(|op| op.id)
            .collect();
        Ok(ops
            .into_iter()
            .filter(|op| op.id.map_or(true, |id| pending.contains(&id)))
            .collect())
    }

    async fn process_operations(&self, image_id: i64, ops: Vec<ExifOperation>) -> Result<()> {
        let mut ops = self.still_pending(ops)?;
        if ops.is_empty() {
            debug!(image_id, "No pending metadata operations left");
            return Ok(());
        }

        let Some(image) = self.cache.get(image_id)? else {
            warn!(image_id, "Image no longer exists, skipping metadata write");
            return Ok(());
        };

        let plan = tool::build_write_plan(&ops);

        // Everything counts as failed unless the write succeeds
        for op in &mut ops {
            op.state = WriteState::Failed;
        }

        if !plan.processed.is_empty() {
            match self.writer.write_tags(&image.path, &plan.args).await {
                Ok(()) => {
                    for &index in &plan.processed {
                        ops[index].state = WriteState::Written;
                    }
                    self.cache.evict(image_id);
                    if let Err(e) = self.rescan.mark_images_for_scan(&[image_id]) {
                        warn!(image_id, error = %e, "Failed to flag image folder for rescan");
                    }
                }
                Err(e) => {
                    warn!(path = %image.path.display(), error = %e, "Metadata write failed");
                    tool::restore_temp_file(&image.path);
                }
            }
        }

        self.db.unit_of_work(|tx| exif_ops::save_states(tx, &ops))?;

        let mut counts: BTreeMap<WriteState, usize> = BTreeMap::new();
        for op in &ops {
            *counts.entry(op.state).or_default() += 1;
        }
        let summary = counts
            .iter()
            .map(|(state, count)| format!("{}: {}", state.as_str(), count))
            .collect::<Vec<_>>()
            .join(", ");
        let filename = image
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        self.notifier.notify(Notification::Status(format!(
            "EXIF data written for {} (ID: {}). {}",
            filename, image_id, summary
        )));
        self.notifier.notify(Notification::MetadataWritten {
            image_id,
            written: counts.get(&WriteState::Written).copied().unwrap_or(0),
            failed: counts.get(&WriteState::Failed).copied().unwrap_or(0),
        });
        Ok(())
    }
}

pub struct ExifService {
    inner: Arc<WriteBack>,
    signal: JobSignal,
    debounce: chrono::Duration,
    retention: chrono::Duration,
    cleanup_interval: Duration,
    last_cleanup: Mutex<Option<Instant>>,
}

impl ExifService {
    pub fn new(
        db: Database,
        config: &ExifConfig,
        writer: Arc<dyn TagWriter>,
        rescan: Arc<dyn RescanProvider>,
        cache: Arc<ImageCache>,
        signal: JobSignal,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(WriteBack {
                db,
                writer,
                rescan,
                cache,
                notifier,
            }),
            signal,
            debounce: chrono::Duration::seconds(config.debounce_secs as i64),
            retention: chrono::Duration::days(i64::from(config.retention_days)),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_hours * 3600),
            last_cleanup: Mutex::new(None),
        }
    }

    /// Log operations for the images that exist and wake the scheduler.
    fn record(
        &self,
        image_ids: &[i64],
        build: impl Fn(i64) -> Vec<ExifOperation>,
    ) -> Result<(usize, usize)> {
        let db = &self.inner.db;
        let ids = images::existing_ids(&db.session(), image_ids)?;
        let ops: Vec<ExifOperation> = ids.iter().flat_map(|&id| build(id)).collect();
        if ops.is_empty() {
            return Ok((0, ids.len()));
        }
        db.unit_of_work(|tx| exif_ops::insert_many(tx, &ops))?;
        self.signal.flag("exif");
        Ok((ops.len(), ids.len()))
    }

    fn status(&self, message: String) {
        self.inner.notifier.notify(Notification::Status(message));
    }

    /// Queue keyword additions and removals. Blank keywords are ignored.
    pub fn update_tags(
        &self,
        image_ids: &[i64],
        add: &[String],
        remove: &[String],
        user_id: Option<i64>,
    ) -> Result<usize> {
        let clean = |tags: &[String]| -> Vec<String> {
            tags.iter()
                .map(|t| sanitize_text(t))
                .filter(|t| !t.is_empty())
                .collect()
        };
        let add = clean(add);
        let remove = clean(remove);

        let (count, images) = self.record(image_ids, |image_id| {
            add.iter()
                .map(|tag| (tag, OperationType::Add))
                .chain(remove.iter().map(|tag| (tag, OperationType::Remove)))
                .map(|(tag, operation)| {
                    let text = tag.as_str();
                    ExifOperation::new(image_id, ExifType::Keyword, operation, text, user_id)
                })
                .collect()
        })?;

        if count > 0 {
            self.status(format!(
                "Saved tags (added: {}, removed: {}) for {} images.",
                add.join(", "),
                remove.join(", "),
                images
            ));
        }
        Ok(count)
    }

    /// Queue a new value for a single-valued field or a rotation.
    pub fn set_exif_field(
        &self,
        image_ids: &[i64],
        exif_type: ExifType,
        value: &str,
        user_id: Option<i64>,
    ) -> Result<usize> {
        let value = sanitize_text(value);
        match exif_type {
            ExifType::Keyword | ExifType::Face => {
                bail!("{} is not a single-valued field", exif_type.as_str())
            }
            ExifType::Rating => match value.parse::<u8>() {
                Ok(rating) if rating <= 5 => {}
                _ => bail!("Rating must be between 0 and 5, got '{}'", value),
            },
            ExifType::Rotate => {
                if value.parse::<i64>().is_err() {
                    bail!("Rotation must be a whole number of degrees, got '{}'", value);
                }
            }
            ExifType::Caption | ExifType::Description | ExifType::Copyright => {}
        }

        let (count, images) = self.record(image_ids, |image_id| {
            vec![ExifOperation::new(
                image_id,
                exif_type,
                OperationType::Add,
                value.as_str(),
                user_id,
            )]
        })?;

        if count > 0 {
            self.status(format!("Saved {} for {} images.", exif_type.as_str(), images));
        }
        Ok(count)
    }

    /// Queue face regions for writing.
    pub fn update_face_data(
        &self,
        image_ids: &[i64],
        faces: &[FaceRegion],
        user_id: Option<i64>,
    ) -> Result<usize> {
        let texts = faces
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        let (count, images) = self.record(image_ids, |image_id| {
            texts
                .iter()
                .map(|text| {
                    let text = text.as_str();
                    ExifOperation::new(image_id, ExifType::Face, OperationType::Add, text, user_id)
                })
                .collect()
        })?;

        if count > 0 {
            self.status(format!("Saved {} face regions for {} images.", faces.len(), images));
        }
        Ok(count)
    }

    /// Delete written operations older than the retention window.
    pub fn cleanup_operations(&self) -> Result<usize> {
        cleanup_written(&self.inner, self.retention)
    }

    fn cleanup_due(&self) -> bool {
        let mut last = self.last_cleanup.lock().unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(at) if at.elapsed() < self.cleanup_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

fn cleanup_written(inner: &WriteBack, retention: chrono::Duration) -> Result<usize> {
    let cutoff = Utc::now() - retention;
    let removed = exif_ops::delete_written_before(&inner.db.session(), &cutoff)?;
    if removed > 0 {
        info!(removed, "Cleaned up written metadata operations");
        let message = format!("Cleaned up {} old metadata operations.", removed);
        inner.notifier.notify(Notification::Status(message));
    }
    Ok(removed)
}

#[async_trait]
impl JobSource for ExifService {
    fn name(&self) -> &'static str {
        "exif"
    }

    fn priority(&self) -> JobPriority {
        JobPriority::ExifService
    }

    async fn pending_jobs(&self, max_count: usize) -> Result<Vec<Box<dyn Job>>> {
        let mut jobs: Vec<Box<dyn Job>> = Vec::new();

        let threshold = Utc::now() - self.debounce;
        let pending = exif_ops::pending_before(&self.inner.db.session(), &threshold, max_count)?;

        if !pending.is_empty() {
            let Conflated { by_image, discarded } = conflate(pending);
            if !discarded.is_empty() {
                debug!(count = discarded.len(), "Discarding superseded metadata operations");
                self.inner
                    .db
                    .unit_of_work(|tx| exif_ops::save_states(tx, &discarded))?;
            }

            for (image_id, ops) in by_image {
                jobs.push(Box::new(ExifJob {
                    image_id,
                    ops,
                    inner: Arc::clone(&self.inner),
                }));
            }
        }

        if jobs.len() < max_count && self.cleanup_due() {
            jobs.push(Box::new(CleanupJob {
                inner: Arc::clone(&self.inner),
                retention: self.retention,
            }));
        }

        Ok(jobs)
    }
}

/// Writes the conflated operations for one image.
struct ExifJob {
    image_id: i64,
    ops: Vec<ExifOperation>,
    inner: Arc<WriteBack>,
}

#[async_trait]
impl Job for ExifJob {
    fn name(&self) -> &str {
        "Writing Metadata"
    }

    fn description(&self) -> String {
        format!("Writing {} Metadata for ID: {}", self.ops.len(), self.image_id)
    }

    fn priority(&self) -> JobPriority {
        JobPriority::ExifService
    }

    async fn process(&self) -> Result<()> {
        self.inner
            .process_operations(self.image_id, self.ops.clone())
            .await
    }
}

struct CleanupJob {
    inner: Arc<WriteBack>,
    retention: chrono::Duration,
}

#[async_trait]
impl Job for CleanupJob {
    fn name(&self) -> &str {
        "Metadata Cleanup"
    }

    fn description(&self) -> String {
        "Clean up written metadata operations".to_string()
    }

    fn priority(&self) -> JobPriority {
        JobPriority::Cleanup
    }

    async fn process(&self) -> Result<()> {
        cleanup_written(&self.inner, self.retention).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::folders;
    use crate::db::images::FileFacts;
    use crate::events::ChannelNotifier;
    use std::path::{Path, PathBuf};
    use std::sync::mpsc::Receiver;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct FakeWriter {
        calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
        fail: bool,
    }

    #[async_trait]
    impl TagWriter for FakeWriter {
        async fn write_tags(&self, path: &Path, args: &[String]) -> Result<(), ExifToolError> {
            self.calls.lock().unwrap().push((path.to_path_buf(), args.to_vec()));
            if self.fail {
                // Simulate a crash after exiftool moved the original aside
                let mut temp = path.as_os_str().to_os_string();
                temp.push("_exiftool_tmp");
                std::fs::rename(path, temp).unwrap();
                return Err(ExifToolError::Failed {
                    status: "exit status: 1".to_string(),
                    stderr: "boom".to_string(),
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRescan {
        marked: Mutex<Vec<i64>>,
    }

    impl RescanProvider for FakeRescan {
        fn mark_images_for_scan(&self, image_ids: &[i64]) -> Result<usize> {
            self.marked.lock().unwrap().extend_from_slice(image_ids);
            Ok(1)
        }
    }

    struct Fixture {
        dir: TempDir,
        db: Database,
        image_id: i64,
        service: ExifService,
        writer: Arc<FakeWriter>,
        rescan: Arc<FakeRescan>,
        signal: JobSignal,
        rx: Receiver<Notification>,
    }

    fn fixture(fail: bool) -> Fixture {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("photo.jpg"), b"jpeg").unwrap();

        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let image_id = {
            let conn = db.session();
            let folder = folders::insert(&conn, dir.path(), None).unwrap();
            let now = Utc::now();
            let facts = FileFacts {
                filename: "photo.jpg".to_string(),
                file_size: 4,
                created: now,
                modified: now,
            };
            images::insert(&conn, folder.id, &facts, &now).unwrap()
        };

        let (notifier, rx) = ChannelNotifier::pair();
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);
        let writer = Arc::new(FakeWriter {
            fail,
            ..Default::default()
        });
        let rescan = Arc::new(FakeRescan::default());
        let signal = JobSignal::new();
        let config = ExifConfig {
            debounce_secs: 0,
            ..ExifConfig::default()
        };
        let service = ExifService::new(
            db.clone(),
            &config,
            writer.clone(),
            rescan.clone(),
            Arc::new(ImageCache::new(db.clone(), Arc::clone(&notifier))),
            signal.clone(),
            notifier,
        );
        Fixture {
            dir,
            db,
            image_id,
            service,
            writer,
            rescan,
            signal,
            rx,
        }
    }

    fn states(f: &Fixture) -> Vec<(ExifType, String, WriteState)> {
        exif_ops::for_image(&f.db.session(), f.image_id)
            .unwrap()
            .into_iter()
            .map(|op| (op.exif_type, op.text, op.state))
            .collect()
    }

    async fn wait_past_debounce() {
        // Timestamps must be strictly older than now - debounce
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    fn exif_jobs(jobs: Vec<Box<dyn Job>>) -> Vec<Box<dyn Job>> {
        jobs.into_iter()
            .filter(|job| job.priority() == JobPriority::ExifService)
            .collect()
    }

    #[tokio::test]
    async fn test_update_tags_records_and_signals() {
        let f = fixture(false);
        let count = f
            .service
            .update_tags(
                &[f.image_id, 9999],
                &["cat".to_string(), "  ".to_string()],
                &["\u{2018}dog\u{2019}".to_string()],
                Some(3),
            )
            .unwrap();

        assert_eq!(count, 2);
        assert!(f.signal.take());
        assert_eq!(
            states(&f),
            vec![
                (ExifType::Keyword, "cat".to_string(), WriteState::Pending),
                (ExifType::Keyword, "'dog'".to_string(), WriteState::Pending),
            ]
        );
        let expected = "Saved tags (added: cat, removed: 'dog') for 1 images.".to_string();
        assert!(f.rx.try_iter().any(|n| n == Notification::Status(expected.clone())));
    }

    #[tokio::test]
    async fn test_set_exif_field_validation() {
        let f = fixture(false);
        assert!(f.service.set_exif_field(&[f.image_id], ExifType::Rating, "7", None).is_err());
        assert!(f.service.set_exif_field(&[f.image_id], ExifType::Keyword, "x", None).is_err());
        assert!(f.service.set_exif_field(&[f.image_id], ExifType::Rotate, "ninety", None).is_err());
        let count = f.service.set_exif_field(&[f.image_id], ExifType::Rating, "4", None);
        assert_eq!(count.unwrap(), 1);
        assert!(f.signal.take());
        assert_eq!(states(&f).len(), 1);
    }

    #[tokio::test]
    async fn test_write_back_success() {
        let f = fixture(false);
        f.service
            .update_tags(&[f.image_id], &["cat".to_string()], &[], None)
            .unwrap();
        f.service
            .update_tags(&[f.image_id], &[], &["cat".to_string()], None)
            .unwrap();
        f.service
            .set_exif_field(&[f.image_id], ExifType::Rotate, "90", None)
            .unwrap();
        f.service
            .set_exif_field(&[f.image_id], ExifType::Rotate, "180", None)
            .unwrap();
        wait_past_debounce().await;

        let jobs = exif_jobs(f.service.pending_jobs(100).await.unwrap());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].description(), format!("Writing 2 Metadata for ID: {}", f.image_id));
        jobs[0].process().await.unwrap();

        let calls = f.writer.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, f.dir.path().join("photo.jpg"));
        assert_eq!(calls[0].1, vec!["-keywords-=cat", "-orientation=Rotate 270 CW"]);

        let mut result = states(&f);
        result.sort();
        assert_eq!(
            result,
            vec![
                (ExifType::Keyword, "cat".to_string(), WriteState::Written),
                (ExifType::Keyword, "cat".to_string(), WriteState::Discarded),
                (ExifType::Rotate, "180".to_string(), WriteState::Discarded),
                (ExifType::Rotate, "270".to_string(), WriteState::Written),
                (ExifType::Rotate, "90".to_string(), WriteState::Discarded),
            ]
        );
        assert_eq!(*f.rescan.marked.lock().unwrap(), vec![f.image_id]);
        assert!(f.rx.try_iter().any(|n| matches!(
            n,
            Notification::MetadataWritten { written: 2, failed: 0, .. }
        )));

        // Nothing left to do
        wait_past_debounce().await;
        assert!(exif_jobs(f.service.pending_jobs(100).await.unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_small_batches_keep_latest_keyword_edit() {
        let f = fixture(false);
        let at = |age_secs: i64, operation: OperationType| {
            let mut op = ExifOperation::new(f.image_id, ExifType::Keyword, operation, "cat", None);
            op.timestamp = Utc::now() - chrono::Duration::seconds(age_secs);
            op
        };
        exif_ops::insert_many(
            &f.db.session(),
            &[at(120, OperationType::Add), at(60, OperationType::Remove)],
        )
        .unwrap();

        for _ in 0..2 {
            let jobs = exif_jobs(f.service.pending_jobs(1).await.unwrap());
            assert_eq!(jobs.len(), 1);
            jobs[0].process().await.unwrap();
        }

        let calls = f.writer.calls.lock().unwrap().clone();
        let args: Vec<Vec<String>> = calls.into_iter().map(|(_, args)| args).collect();
        assert_eq!(
            args,
            vec![
                vec!["-keywords-=cat".to_string(), "-keywords+=cat".to_string()],
                vec!["-keywords-=cat".to_string()],
            ]
        );
        assert!(states(&f).iter().all(|(_, _, state)| *state == WriteState::Written));
    }

    #[tokio::test]
    async fn test_write_back_failure_restores_file() {
        let f = fixture(true);
        f.service
            .set_exif_field(&[f.image_id], ExifType::Caption, "Harbour", None)
            .unwrap();
        wait_past_debounce().await;

        let jobs = exif_jobs(f.service.pending_jobs(100).await.unwrap());
        jobs[0].process().await.unwrap();

        assert_eq!(
            states(&f),
            vec![(ExifType::Caption, "Harbour".to_string(), WriteState::Failed)]
        );
        assert!(f.dir.path().join("photo.jpg").exists());
        assert!(f.rescan.marked.lock().unwrap().is_empty());
        assert!(f.rx.try_iter().any(|n| matches!(
            n,
            Notification::MetadataWritten { written: 0, failed: 1, .. }
        )));
    }

    #[tokio::test]
    async fn test_cleanup_job_emitted_once_per_interval() {
        let f = fixture(false);
        let first = f.service.pending_jobs(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].priority(), JobPriority::Cleanup);
        first[0].process().await.unwrap();

        assert!(f.service.pending_jobs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_debounce_holds_fresh_operations() {
        let mut f = fixture(false);
        f.service.debounce = chrono::Duration::seconds(30);
        f.service
            .update_tags(&[f.image_id], &["fresh".to_string()], &[], None)
            .unwrap();
        assert!(exif_jobs(f.service.pending_jobs(10).await.unwrap()).is_empty());
        assert_eq!(states(&f)[0].2, WriteState::Pending);
    }
}
