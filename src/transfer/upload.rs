//! Resumable upload of a local file

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use tracing::{debug, info, warn};

use super::engine::{paced_fill, run_parts, Checkpointer, Lifecycle, PartOutcome, TransferPlan};
use super::{TransferOutcome, TransferState, UploadRequest};
use crate::checkpoint::{CheckpointRecord, FileStat, OpType, TransferIdentity};
use crate::client::{validate_object_name, MultipartUpload, MultipartUploadRequest, TransferClient};
use crate::error::{codes, Result, VaultError};
use crate::partition::{partition, PartTask};

impl TransferClient {
    /// Upload a local file, resuming from a checkpoint when one matches
    ///
    /// Files no larger than one part go up with a single PutObject. Larger
    /// files use a multipart session whose progress is checkpointed after
    /// every part; a failed call leaves the checkpoint in place so the same
    /// request continues where it stopped.
    pub fn resumable_upload(&self, request: &UploadRequest) -> Result<TransferOutcome> {
        let lifecycle = Lifecycle::new(
            OpType::Upload,
            &request.bucket,
            &request.key,
            request.options.progress.clone(),
        );
        let result = lifecycle.in_span(|| self.run_upload(request, &lifecycle));
        lifecycle.finish(result)
    }

    fn run_upload(&self, request: &UploadRequest, lifecycle: &Lifecycle) -> Result<TransferOutcome> {
        validate_object_name(&request.bucket, &request.key)?;
        let path = &request.local_path;
        if path.as_os_str().is_empty() {
            return Err(VaultError::Validate("local file path is empty".to_string()));
        }
        if !path.is_file() {
            return Err(VaultError::Validate(format!(
                "local file does not exist: {}",
                path.display()
            )));
        }
        let plan = TransferPlan::resolve(self.config(), &request.options, OpType::Upload)?;
        self.materials()?;

        let stat = FileStat::of(path)?;
        let identity =
            TransferIdentity::new(OpType::Upload, &request.bucket, &request.key).with_local_path(path);
        let checkpointer = plan.checkpointer(&identity);

        if stat.size <= plan.part_size {
            // A multipart attempt left by a larger version of the file
            if let Some(record) = checkpointer.load() {
                warn!(
                    "Discarding checkpoint for {}/{}: file now fits in one part",
                    request.bucket, request.key
                );
                checkpointer.delete();
                self.abort_stale_upload(&record);
            }
            return self.upload_single(request, &plan, lifecycle, stat.size);
        }

        let tasks = partition(stat.size, plan.part_size)?;

        let mut restarted = false;
        loop {
            let (upload, mut record, resumed) =
                self.open_upload(request, &plan, &checkpointer, &tasks, stat, lifecycle)?;
            match self.upload_parts(request, &plan, &checkpointer, &upload, &mut record, resumed, lifecycle) {
                Err(e) if resumed && !restarted && e.has_service_code(codes::NO_SUCH_UPLOAD) => {
                    warn!(
                        "Upload {} is gone, restarting {}/{} from scratch",
                        upload.upload_id, request.bucket, request.key
                    );
                    checkpointer.delete();
                    lifecycle.restart();
                    restarted = true;
                }
                result => return result,
            }
        }
    }

    fn upload_single(
        &self,
        request: &UploadRequest,
        plan: &TransferPlan,
        lifecycle: &Lifecycle,
        size: u64,
    ) -> Result<TransferOutcome> {
        debug!("{} bytes fit in one part, using a single request", size);
        let tracker = lifecycle.tracker(size, 0);
        lifecycle.enter(TransferState::InFlight);
        let mut file = File::open(&request.local_path)?;
        let mut data = vec![0u8; size as usize];
        paced_fill(&plan.limiter, &tracker.part(), &mut data, |_, chunk| {
            file.read_exact(chunk)?;
            Ok(())
        })?;
        let output = self.put_object(&request.bucket, &request.key, data, &request.metadata)?;

        Ok(TransferOutcome {
            state: TransferState::Done,
            resumed: false,
            single_request: true,
            upload_id: None,
            etag: output.etag,
            crc32: output.crc32,
            version_id: output.version_id,
            total_bytes: size,
            transferred_bytes: size,
            part_count: 1,
        })
    }

    /// Reattach to the checkpointed session or start a new one
    fn open_upload(
        &self,
        request: &UploadRequest,
        plan: &TransferPlan,
        checkpointer: &Checkpointer,
        tasks: &[PartTask],
        stat: FileStat,
        lifecycle: &Lifecycle,
    ) -> Result<(MultipartUpload, CheckpointRecord, bool)> {
        if let Some(record) = checkpointer.load() {
            match self.stale_upload_reason(&record, request, plan, tasks, stat) {
                None => {
                    let upload_id = record.upload_id.clone().unwrap_or_default();
                    match self.resume_multipart_upload(
                        &request.bucket,
                        &request.key,
                        &upload_id,
                        record.encryption.as_ref(),
                        plan.part_size,
                        stat.size,
                    ) {
                        Ok(upload) => {
                            lifecycle.enter(TransferState::Resume);
                            info!(
                                "Resuming upload {} of {} ({}/{} parts done)",
                                upload_id,
                                request.local_path.display(),
                                record.parts.len() - record.pending_tasks().len(),
                                record.parts.len()
                            );
                            return Ok((upload, record, true));
                        }
                        Err(e) => warn!("Cannot resume upload {}: {}", upload_id, e),
                    }
                }
                Some(reason) => warn!(
                    "Discarding checkpoint for {}/{}: {}",
                    request.bucket, request.key, reason
                ),
            }
            checkpointer.delete();
            self.abort_stale_upload(&record);
        }

        lifecycle.enter(TransferState::FreshStart);
        let upload = self.initiate_multipart_upload(
            &MultipartUploadRequest::new(&request.bucket, &request.key)
                .with_metadata(request.metadata.clone())
                .with_part_size(plan.part_size)
                .with_data_size(stat.size),
        )?;

        let mut record =
            CheckpointRecord::new(OpType::Upload, &request.bucket, &request.key, plan.part_size, tasks);
        record.upload_id = Some(upload.upload_id.clone());
        record.local_path = Some(request.local_path.to_string_lossy().into_owned());
        record.file_stat = Some(stat);
        record.encryption = upload.crypto.as_ref().map(|c| c.material.to_record());
        record.metadata = request.metadata.to_headers();

        // Persist before any part runs
        if let Err(e) = checkpointer.save(&record) {
            self.abort_stale_upload(&record);
            return Err(e);
        }
        Ok((upload, record, false))
    }

    /// Why a loaded checkpoint cannot be resumed, if it cannot
    fn stale_upload_reason(
        &self,
        record: &CheckpointRecord,
        request: &UploadRequest,
        plan: &TransferPlan,
        tasks: &[PartTask],
        stat: FileStat,
    ) -> Option<String> {
        let local_path = request.local_path.to_string_lossy();
        if record.op_type != OpType::Upload
            || record.bucket != request.bucket
            || record.key != request.key
            || record.local_path.as_deref() != Some(local_path.as_ref())
        {
            return Some("checkpoint belongs to another transfer".to_string());
        }
        if record.upload_id.as_deref().map_or(true, str::is_empty) {
            return Some("no upload id".to_string());
        }
        if record.file_stat != Some(stat) {
            return Some("local file changed".to_string());
        }
        if record.part_size != plan.part_size || !record.matches_layout(tasks) {
            return Some("part layout changed".to_string());
        }
        if record.encryption.is_some() != self.capabilities().supports_encryption {
            return Some("encryption setting changed".to_string());
        }
        None
    }

    /// Best-effort abort of a session that will not be resumed
    fn abort_stale_upload(&self, record: &CheckpointRecord) {
        let Some(upload_id) = record.upload_id.as_deref().filter(|id| !id.is_empty()) else {
            return;
        };
        if let Err(e) = self.abort_multipart_upload(&record.bucket, &record.key, upload_id) {
            debug!("Could not abort stale upload {}: {}", upload_id, e);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn upload_parts(
        &self,
        request: &UploadRequest,
        plan: &TransferPlan,
        checkpointer: &Checkpointer,
        upload: &MultipartUpload,
        record: &mut CheckpointRecord,
        resumed: bool,
        lifecycle: &Lifecycle,
    ) -> Result<TransferOutcome> {
        let tracker = lifecycle.tracker(record.total_bytes(), record.completed_bytes());
        lifecycle.enter(TransferState::InFlight);

        let path = &request.local_path;
        let moved = run_parts(plan, record, checkpointer, &tracker, |task, progress| {
            // One handle per part so workers never share a seek position
            let mut file = File::open(path)?;
            file.seek(SeekFrom::Start(task.offset))?;
            let mut data = vec![0u8; task.length as usize];
            paced_fill(&plan.limiter, progress, &mut data, |_, chunk| {
                file.read_exact(chunk)?;
                Ok(())
            })?;

            let part = self.upload_part(upload, task.part_number, data)?;
            Ok(PartOutcome {
                part_number: task.part_number,
                size: task.length,
                etag: Some(part.etag),
                crc32: part.crc32,
            })
        })?;

        lifecycle.enter(TransferState::Finalizing);
        let parts = record.part_etags()?;
        let output = self.complete_multipart_upload(upload, &parts)?;

        if self.config().crc_check_enabled {
            if let (Some(expected), Some(actual)) = (record.combined_crc32(), output.crc32) {
                if expected != actual {
                    return Err(VaultError::ChecksumMismatch {
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    }
                    .context(format!("upload {}", upload.upload_id)));
                }
            }
        }
        checkpointer.delete();

        Ok(TransferOutcome {
            state: TransferState::Done,
            resumed,
            single_request: false,
            upload_id: Some(upload.upload_id.clone()),
            etag: output.etag,
            crc32: output.crc32,
            version_id: output.version_id,
            total_bytes: record.total_bytes(),
            transferred_bytes: moved,
            part_count: record.parts.len(),
        })
    }
}
