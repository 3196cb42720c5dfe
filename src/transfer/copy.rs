//! Resumable server-side copy through UploadPartCopy

use tracing::{debug, info, warn};

use super::engine::{run_parts, Checkpointer, Lifecycle, PartOutcome, TransferPlan};
use super::{CopyRequest, TransferOutcome, TransferState};
use crate::checkpoint::{CheckpointRecord, ObjectStat, OpType, TransferIdentity};
use crate::client::{validate_object_name, MultipartUpload, MultipartUploadRequest, TransferClient};
use crate::error::{codes, Result, VaultError};
use crate::partition::{partition, PartTask};
use crate::types::{ByteRange, Conditions, CopySource, ObjectInfo, ObjectMetadata};

impl TransferClient {
    /// Copy an object, resuming from a checkpoint when one matches
    ///
    /// Sources no larger than one part are copied with a single CopyObject.
    /// Each part copy is pinned to the source etag seen when the copy was
    /// planned. Not available on encryption clients.
    pub fn resumable_copy(&self, request: &CopyRequest) -> Result<TransferOutcome> {
        let lifecycle = Lifecycle::new(
            OpType::Copy,
            &request.bucket,
            &request.key,
            request.options.progress.clone(),
        );
        let result = lifecycle.in_span(|| self.run_copy(request, &lifecycle));
        lifecycle.finish(result)
    }

    fn run_copy(&self, request: &CopyRequest, lifecycle: &Lifecycle) -> Result<TransferOutcome> {
        self.reject_if_encrypted("ResumableCopy")?;
        validate_object_name(&request.src_bucket, &request.src_key)?;
        validate_object_name(&request.bucket, &request.key)?;
        let plan = TransferPlan::resolve(self.config(), &request.options, OpType::Copy)?;

        let headers = self.head_headers(
            &request.src_bucket,
            &request.src_key,
            request.src_version_id.as_deref(),
            &Conditions::default(),
        )?;
        let source = ObjectInfo::from_headers(&headers);
        // Every copy request reads the version seen here, as long as it is unchanged
        let copy_source = CopySource::new(&request.src_bucket, &request.src_key)
            .with_version_id(request.src_version_id.clone())
            .with_if_match(source.etag.clone());

        let identity = TransferIdentity::new(OpType::Copy, &request.bucket, &request.key)
            .with_source(&request.src_bucket, &request.src_key)
            .with_version(request.src_version_id.clone());
        let checkpointer = plan.checkpointer(&identity);

        if source.size <= plan.part_size {
            if let Some(record) = checkpointer.load() {
                warn!(
                    "Discarding checkpoint for copy to {}/{}: source now fits in one part",
                    request.bucket, request.key
                );
                checkpointer.delete();
                self.abort_stale_copy(&record);
            }
            debug!("{} bytes fit in one part, using a single copy", source.size);
            let tracker = lifecycle.tracker(source.size, 0);
            lifecycle.enter(TransferState::InFlight);
            let output = self.copy_object_from(
                &copy_source,
                &request.bucket,
                &request.key,
                request.metadata.as_ref(),
            )?;
            tracker.add(source.size);
            return Ok(TransferOutcome {
                state: TransferState::Done,
                resumed: false,
                single_request: true,
                upload_id: None,
                etag: output.etag,
                crc32: output.crc32,
                version_id: output.version_id,
                total_bytes: source.size,
                transferred_bytes: source.size,
                part_count: 1,
            });
        }

        let tasks = partition(source.size, plan.part_size)?;
        let source_stat = ObjectStat {
            size: source.size,
            etag: source.etag.clone(),
            last_modified: source.last_modified.clone(),
        };

        let mut restarted = false;
        loop {
            let (upload, mut record, resumed) =
                self.open_copy(request, &plan, &checkpointer, &tasks, &source, &source_stat, lifecycle)?;
            match self.copy_parts(&plan, &checkpointer, &upload, &mut record, &copy_source, resumed, lifecycle) {
                Err(e) if resumed && !restarted && e.has_service_code(codes::NO_SUCH_UPLOAD) => {
                    warn!(
                        "Upload {} is gone, restarting copy to {}/{} from scratch",
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

    #[allow(clippy::too_many_arguments)]
    fn open_copy(
        &self,
        request: &CopyRequest,
        plan: &TransferPlan,
        checkpointer: &Checkpointer,
        tasks: &[PartTask],
        source: &ObjectInfo,
        source_stat: &ObjectStat,
        lifecycle: &Lifecycle,
    ) -> Result<(MultipartUpload, CheckpointRecord, bool)> {
        if let Some(record) = checkpointer.load() {
            match stale_copy_reason(&record, request, plan, tasks, source_stat) {
                None => {
                    let upload_id = record.upload_id.clone().unwrap_or_default();
                    let upload = self.resume_multipart_upload(
                        &request.bucket,
                        &request.key,
                        &upload_id,
                        None,
                        plan.part_size,
                        source.size,
                    )?;
                    lifecycle.enter(TransferState::Resume);
                    info!(
                        "Resuming copy {} to {}/{} ({}/{} parts done)",
                        upload_id,
                        request.bucket,
                        request.key,
                        record.parts.len() - record.pending_tasks().len(),
                        record.parts.len()
                    );
                    return Ok((upload, record, true));
                }
                Some(reason) => {
                    warn!(
                        "Discarding checkpoint for copy to {}/{}: {}",
                        request.bucket, request.key, reason
                    );
                    checkpointer.delete();
                    self.abort_stale_copy(&record);
                }
            }
        }

        lifecycle.enter(TransferState::FreshStart);
        let metadata = request.metadata.clone().unwrap_or_else(|| ObjectMetadata {
            content_type: source.content_type.clone(),
            user_metadata: source.user_metadata.clone(),
            ..ObjectMetadata::default()
        });
        let upload = self.initiate_multipart_upload(
            &MultipartUploadRequest::new(&request.bucket, &request.key)
                .with_metadata(metadata.clone())
                .with_part_size(plan.part_size)
                .with_data_size(source.size),
        )?;

        let mut record =
            CheckpointRecord::new(OpType::Copy, &request.bucket, &request.key, plan.part_size, tasks);
        record.upload_id = Some(upload.upload_id.clone());
        record.src_bucket = Some(request.src_bucket.clone());
        record.src_key = Some(request.src_key.clone());
        record.version_id = request.src_version_id.clone();
        record.object_stat = Some(source_stat.clone());
        record.metadata = metadata.to_headers();
        checkpointer.save(&record)?;
        Ok((upload, record, false))
    }

    /// Best-effort abort of a session that will not be resumed
    fn abort_stale_copy(&self, record: &CheckpointRecord) {
        let Some(upload_id) = record.upload_id.as_deref().filter(|id| !id.is_empty()) else {
            return;
        };
        if let Err(e) = self.abort_multipart_upload(&record.bucket, &record.key, upload_id) {
            debug!("Could not abort stale upload {}: {}", upload_id, e);
        }
    }

    /// Copy every pending part; progress moves once per part
    #[allow(clippy::too_many_arguments)]
    fn copy_parts(
        &self,
        plan: &TransferPlan,
        checkpointer: &Checkpointer,
        upload: &MultipartUpload,
        record: &mut CheckpointRecord,
        copy_source: &CopySource,
        resumed: bool,
        lifecycle: &Lifecycle,
    ) -> Result<TransferOutcome> {
        let tracker = lifecycle.tracker(record.total_bytes(), record.completed_bytes());
        lifecycle.enter(TransferState::InFlight);

        let moved = run_parts(plan, record, checkpointer, &tracker, |task, _| {
            let part = self.upload_part_copy(
                upload,
                task.part_number,
                copy_source,
                Some(ByteRange::new(task.offset, task.end() - 1)),
            )?;
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
                    .context(format!("copy {}", upload.upload_id)));
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

fn stale_copy_reason(
    record: &CheckpointRecord,
    request: &CopyRequest,
    plan: &TransferPlan,
    tasks: &[PartTask],
    source_stat: &ObjectStat,
) -> Option<String> {
    if record.op_type != OpType::Copy
        || record.bucket != request.bucket
        || record.key != request.key
        || record.src_bucket.as_deref() != Some(request.src_bucket.as_str())
        || record.src_key.as_deref() != Some(request.src_key.as_str())
        || record.version_id != request.src_version_id
    {
        return Some("checkpoint belongs to another transfer".to_string());
    }
    if record.upload_id.as_deref().map_or(true, str::is_empty) {
        return Some("no upload id".to_string());
    }
    if record.object_stat.as_ref() != Some(source_stat) {
        return Some("source object changed".to_string());
    }
    if record.part_size != plan.part_size || !record.matches_layout(tasks) {
        return Some("part layout changed".to_string());
    }
    None
}
