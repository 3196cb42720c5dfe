//! Resumable download into a local file
//!
//! Parts are written into `<target>.temp`, preallocated to the full span, and
//! the temp file is renamed onto the target only after every part is written
//! and verified.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::engine::{paced_chunks, run_parts, Checkpointer, Lifecycle, PartOutcome, TransferPlan};
use super::{DownloadRequest, TransferOutcome, TransferState};
use crate::checkpoint::{CheckpointRecord, ObjectStat, OpType, TransferIdentity};
use crate::checksum;
use crate::client::object::content_range_start;
use crate::client::{validate_object_name, GetObjectOptions, TransferClient};
use crate::crypto::{self, ContentCryptoMaterial};
use crate::error::{Result, VaultError};
use crate::partition::{partition, PartTask};
use crate::progress::PartProgress;
use crate::types::{ByteRange, Conditions, ObjectInfo};

/// Path the download is staged in until it completes
pub fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(".temp");
    PathBuf::from(name)
}

/// What the remote object looked like when the download was planned
struct RemoteObject {
    info: ObjectInfo,
    material: Option<ContentCryptoMaterial>,
    /// Half-open span `[start, end)` of the object to fetch
    start: u64,
    end: u64,
}

impl RemoteObject {
    fn stat(&self) -> ObjectStat {
        ObjectStat {
            size: self.info.size,
            etag: self.info.etag.clone(),
            last_modified: self.info.last_modified.clone(),
        }
    }

    fn span(&self) -> u64 {
        self.end - self.start
    }

    fn is_whole_object(&self) -> bool {
        self.start == 0 && self.end == self.info.size
    }
}

impl TransferClient {
    /// Download an object, or a range of it, resuming when a checkpoint matches
    ///
    /// Conditions and the range are checked once against the object before
    /// any part is scheduled. A checkpoint recorded against a different
    /// version of the object (size, etag or modification time) is discarded.
    pub fn resumable_download(&self, request: &DownloadRequest) -> Result<TransferOutcome> {
        let lifecycle = Lifecycle::new(
            OpType::Download,
            &request.bucket,
            &request.key,
            request.options.progress.clone(),
        );
        let result = lifecycle.in_span(|| self.run_download(request, &lifecycle));
        lifecycle.finish(result)
    }

    fn run_download(&self, request: &DownloadRequest, lifecycle: &Lifecycle) -> Result<TransferOutcome> {
        validate_object_name(&request.bucket, &request.key)?;
        let target = &request.local_path;
        if target.as_os_str().is_empty() {
            return Err(VaultError::Validate("local file path is empty".to_string()));
        }
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(VaultError::Validate(format!(
                    "destination directory does not exist: {}",
                    parent.display()
                )));
            }
        }
        if let Some(range) = &request.range {
            range.validate()?;
        }
        let plan = TransferPlan::resolve(self.config(), &request.options, OpType::Download)?;

        let remote = self.plan_remote(request)?;
        let temp_path = temp_path_for(target);

        if remote.span() == 0 {
            lifecycle.tracker(0, 0);
            File::create(&temp_path)?.sync_all()?;
            fs::rename(&temp_path, target)?;
            return Ok(TransferOutcome {
                state: TransferState::Done,
                resumed: false,
                single_request: true,
                upload_id: None,
                etag: remote.info.etag,
                crc32: remote.info.crc32,
                version_id: remote.info.version_id,
                total_bytes: 0,
                transferred_bytes: 0,
                part_count: 0,
            });
        }

        let tasks = partition(remote.span(), plan.part_size)?;
        let identity = TransferIdentity::new(OpType::Download, &request.bucket, &request.key)
            .with_version(request.version_id.clone())
            .with_local_path(target);
        let checkpointer = plan.checkpointer(&identity);

        let (mut record, resumed) =
            self.open_download(request, &plan, &checkpointer, &remote, &tasks, &temp_path, lifecycle)?;

        let tracker = lifecycle.tracker(record.total_bytes(), record.completed_bytes());
        lifecycle.enter(TransferState::InFlight);

        let moved = run_parts(&plan, &mut record, &checkpointer, &tracker, |task, progress| {
            self.download_part(request, &plan, &remote, &temp_path, task, progress)
        })?;

        lifecycle.enter(TransferState::Finalizing);
        let crc32 = record.combined_crc32();
        if self.config().crc_check_enabled && remote.is_whole_object() {
            if let (Some(expected), Some(actual)) = (remote.info.crc32, crc32) {
                if expected != actual {
                    // The recorded parts are not trustworthy; start over next time
                    checkpointer.delete();
                    let _ = fs::remove_file(&temp_path);
                    return Err(VaultError::ChecksumMismatch {
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    }
                    .context(format!("download {}/{}", request.bucket, request.key)));
                }
            }
        }

        OpenOptions::new().write(true).open(&temp_path)?.sync_all()?;
        fs::rename(&temp_path, target)?;
        checkpointer.delete();

        Ok(TransferOutcome {
            state: TransferState::Done,
            resumed,
            single_request: false,
            upload_id: None,
            etag: remote.info.etag.clone(),
            crc32: if remote.is_whole_object() { crc32 } else { None },
            version_id: remote.info.version_id.clone(),
            total_bytes: record.total_bytes(),
            transferred_bytes: moved,
            part_count: record.parts.len(),
        })
    }

    /// Check conditions, resolve the range and unwrap the content key once
    fn plan_remote(&self, request: &DownloadRequest) -> Result<RemoteObject> {
        let materials = self.materials()?;
        let headers = self.head_headers(
            &request.bucket,
            &request.key,
            request.version_id.as_deref(),
            &request.conditions,
        )?;

        let material = match materials {
            Some(materials) => match crypto::parse_envelope(&headers)? {
                Some(record) => Some(materials.unwrap_content_material(&record)?),
                None => None,
            },
            None => None,
        };

        let info = ObjectInfo::from_headers(&headers);
        let (start, end) = match &request.range {
            Some(range) => range.resolve(info.size)?,
            None => (0, info.size),
        };
        debug!(
            "Planned download of {}/{} bytes {}..{} of {}{}",
            request.bucket,
            request.key,
            start,
            end,
            info.size,
            if material.is_some() { " (encrypted)" } else { "" }
        );
        Ok(RemoteObject {
            info,
            material,
            start,
            end,
        })
    }

    /// Resume from a matching checkpoint and temp file, or start over
    #[allow(clippy::too_many_arguments)]
    fn open_download(
        &self,
        request: &DownloadRequest,
        plan: &TransferPlan,
        checkpointer: &Checkpointer,
        remote: &RemoteObject,
        tasks: &[PartTask],
        temp_path: &Path,
        lifecycle: &Lifecycle,
    ) -> Result<(CheckpointRecord, bool)> {
        if let Some(record) = checkpointer.load() {
            match stale_download_reason(&record, request, plan, remote, tasks, temp_path) {
                None => {
                    lifecycle.enter(TransferState::Resume);
                    info!(
                        "Resuming download of {}/{} into {} ({}/{} parts done)",
                        request.bucket,
                        request.key,
                        temp_path.display(),
                        record.parts.len() - record.pending_tasks().len(),
                        record.parts.len()
                    );
                    return Ok((record, true));
                }
                Some(reason) => {
                    warn!(
                        "Discarding checkpoint for {}/{}: {}",
                        request.bucket, request.key, reason
                    );
                    checkpointer.delete();
                }
            }
        }

        lifecycle.enter(TransferState::FreshStart);
        let file = File::create(temp_path)?;
        file.set_len(remote.span())?;

        let mut record = CheckpointRecord::new(
            OpType::Download,
            &request.bucket,
            &request.key,
            plan.part_size,
            tasks,
        );
        record.version_id = request.version_id.clone();
        record.local_path = Some(request.local_path.to_string_lossy().into_owned());
        record.object_stat = Some(remote.stat());
        record.range_start = Some(remote.start);
        record.range_end = Some(remote.end);
        checkpointer.save(&record)?;
        Ok((record, false))
    }

    /// Fetch one part, decrypt it at its absolute offset and write it in place
    fn download_part(
        &self,
        request: &DownloadRequest,
        plan: &TransferPlan,
        remote: &RemoteObject,
        temp_path: &Path,
        task: &PartTask,
        progress: &PartProgress<'_>,
    ) -> Result<PartOutcome> {
        let first = remote.start + task.offset;
        let mut options = GetObjectOptions::new()
            .with_range(ByteRange::new(first, first + task.length - 1))
            .with_conditions(Conditions {
                if_match: remote.info.etag.clone(),
                ..Conditions::default()
            });
        if let Some(version_id) = &request.version_id {
            options = options.with_version_id(version_id);
        }
        if let Some(limit) = request.options.traffic_limit {
            options = options.with_traffic_limit(limit);
        }

        let response = self.send(Self::get_request(&request.bucket, &request.key, &options))?;
        let offset = response
            .header("content-range")
            .and_then(content_range_start)
            .unwrap_or(0);
        if offset != first {
            return Err(VaultError::Network(format!(
                "part {}: asked for offset {}, got {}",
                task.part_number, first, offset
            )));
        }
        let mut data = response.body;
        if data.len() as u64 != task.length {
            return Err(VaultError::Network(format!(
                "part {}: expected {} bytes, got {}",
                task.part_number,
                task.length,
                data.len()
            )));
        }

        // CRC of the stored bytes, comparable with the object's checksum
        let crc32 = checksum::crc32(&data);
        if let Some(material) = &remote.material {
            crypto::transform_at(&material.key, &material.iv, first, &mut data)?;
        }

        let mut file = OpenOptions::new().write(true).open(temp_path)?;
        file.seek(SeekFrom::Start(task.offset))?;
        paced_chunks(&plan.limiter, progress, &data, |_, chunk| {
            file.write_all(chunk)?;
            Ok(())
        })?;

        Ok(PartOutcome {
            part_number: task.part_number,
            size: task.length,
            etag: None,
            crc32: Some(crc32),
        })
    }
}

fn stale_download_reason(
    record: &CheckpointRecord,
    request: &DownloadRequest,
    plan: &TransferPlan,
    remote: &RemoteObject,
    tasks: &[PartTask],
    temp_path: &Path,
) -> Option<String> {
    let local_path = request.local_path.to_string_lossy();
    if record.op_type != OpType::Download
        || record.bucket != request.bucket
        || record.key != request.key
        || record.version_id != request.version_id
        || record.local_path.as_deref() != Some(local_path.as_ref())
    {
        return Some("checkpoint belongs to another transfer".to_string());
    }
    if record.object_stat.as_ref() != Some(&remote.stat()) {
        return Some("remote object changed".to_string());
    }
    if record.range_start != Some(remote.start) || record.range_end != Some(remote.end) {
        return Some("range changed".to_string());
    }
    if record.part_size != plan.part_size || !record.matches_layout(tasks) {
        return Some("part layout changed".to_string());
    }
    match fs::metadata(temp_path) {
        Ok(metadata) if metadata.len() == remote.span() => None,
        Ok(_) => Some("temp file has the wrong length".to_string()),
        Err(_) => Some("temp file is missing".to_string()),
    }
}
