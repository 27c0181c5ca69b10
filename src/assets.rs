//! publishes the built frontend into the site bucket. the entry document
//! may only be cached briefly; everything else is content hashed by the
//! frontend build and can be cached for a year. after an upload, objects
//! the build no longer produces are deleted and the distribution is
//! invalidated so files without a content hash do not go stale at the edge.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use aws_sdk_cloudfront::types::{InvalidationBatch, Paths};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::stack::{DISTRIBUTION_ID_OUTPUT, FRONTEND_BUCKET_OUTPUT};

/// `DeleteObjects` takes at most this many keys per request.
pub const MAX_DELETE_BATCH: usize = 1000;

pub const INVALIDATE_ALL: &str = "/*";

pub const ENTRY_CACHE_CONTROL: &str = "public, max-age=60";
pub const ASSET_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheClass {
    Immutable,
    EntryDocument,
}

impl CacheClass {
    pub fn cache_control(&self) -> &'static str {
        match self {
            CacheClass::EntryDocument => ENTRY_CACHE_CONTROL,
            CacheClass::Immutable => ASSET_CACHE_CONTROL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedUpload {
    pub path: PathBuf,
    /// object key, always `/` separated.
    pub key: String,
    pub content_type: String,
    pub cache_class: CacheClass,
}

fn iter_files_recursively<P: AsRef<Path>>(
    start_dir: P,
    callback: &mut impl FnMut(PathBuf) -> Result<()>,
) -> Result<()> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| Error::Io { path, source }
    };
    let readdir = std::fs::read_dir(start_dir.as_ref()).map_err(io_err(start_dir.as_ref()))?;
    for entry in readdir {
        let direntry = entry.map_err(io_err(start_dir.as_ref()))?;
        let path = direntry.path();
        let fp = direntry.file_type().map_err(io_err(&path))?;
        if fp.is_dir() {
            iter_files_recursively(&path, callback)?;
        } else {
            callback(path)?;
        }
    }
    Ok(())
}

fn object_key(dist_dir: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(dist_dir).unwrap_or(path);
    relative.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// every file under `dist_dir`, immutable assets first so a new entry
/// document never points at assets that are not uploaded yet.
pub fn plan_uploads(dist_dir: &Path, entry_document: &str) -> Result<Vec<PlannedUpload>> {
    let mut out = vec![];
    iter_files_recursively(dist_dir, &mut |path| {
        let key = object_key(dist_dir, &path);
        let is_entry = path.file_name().map_or(false, |name| name == entry_document);
        let cache_class = if is_entry { CacheClass::EntryDocument } else { CacheClass::Immutable };
        let content_type = mime_guess::from_path(&path).first_or_octet_stream().to_string();
        out.push(PlannedUpload { path, key, content_type, cache_class });
        Ok(())
    })?;
    if !out.iter().any(|u| u.key == entry_document) {
        return Err(Error::Config(format!(
            "{:?} has no {entry_document} at its root. Build the frontend first", dist_dir,
        )));
    }
    out.sort_by(|a, b| (a.cache_class, &a.key).cmp(&(b.cache_class, &b.key)));
    Ok(out)
}

/// the bucket the site is served from, and the cdn in front of it.
#[async_trait]
pub trait AssetSink {
    async fn put(&self, upload: &PlannedUpload, body: Vec<u8>) -> Result<()>;
    /// every key currently in the bucket.
    async fn list_keys(&self) -> Result<Vec<String>>;
    /// called with at most `MAX_DELETE_BATCH` keys at a time.
    async fn delete(&self, keys: &[String]) -> Result<()>;
    async fn invalidate(&self, paths: &[&str]) -> Result<()>;
}

/// where `publish` writes to, as recorded in the deployed stack's outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub bucket: String,
    pub distribution_id: String,
}

pub struct S3Sink {
    s3: aws_sdk_s3::Client,
    cloudfront: aws_sdk_cloudfront::Client,
    target: PublishTarget,
}

impl S3Sink {
    pub fn new(s3: aws_sdk_s3::Client, cloudfront: aws_sdk_cloudfront::Client, target: PublishTarget) -> Self {
        Self { s3, cloudfront, target }
    }
}

#[async_trait]
impl AssetSink for S3Sink {
    async fn put(&self, upload: &PlannedUpload, body: Vec<u8>) -> Result<()> {
        self.s3
            .put_object()
            .bucket(&self.target.bucket)
            .key(&upload.key)
            .content_type(&upload.content_type)
            .cache_control(upload.cache_class.cache_control())
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| Error::Upload { key: upload.key.clone(), reason: format!("{:?}", e) })?;
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let prune_err = |reason: String| Error::Prune { bucket: self.target.bucket.clone(), reason };
        let mut keys = vec![];
        let mut continuation_token = None;
        loop {
            let page = self.s3
                .list_objects_v2()
                .bucket(&self.target.bucket)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| prune_err(format!("{:?}", e)))?;
            keys.extend(page.contents().iter().filter_map(|o| o.key()).map(str::to_string));
            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => continuation_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let prune_err = |reason: String| Error::Prune { bucket: self.target.bucket.clone(), reason };
        let objects = keys.iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| prune_err(e.to_string()))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|e| prune_err(e.to_string()))?;
        let out = self.s3
            .delete_objects()
            .bucket(&self.target.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| prune_err(format!("{:?}", e)))?;
        if let Some(failed) = out.errors().first() {
            return Err(prune_err(format!(
                "{} of {} keys were not deleted. first: {:?} {:?}",
                out.errors().len(), keys.len(), failed.key(), failed.message(),
            )));
        }
        Ok(())
    }

    async fn invalidate(&self, paths: &[&str]) -> Result<()> {
        let invalidate_err = |reason: String| Error::Invalidate {
            distribution: self.target.distribution_id.clone(),
            reason,
        };
        let millis = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or_default();
        let paths = Paths::builder()
            .quantity(paths.len() as i32)
            .set_items(Some(paths.iter().map(|p| p.to_string()).collect()))
            .build()
            .map_err(|e| invalidate_err(e.to_string()))?;
        let batch = InvalidationBatch::builder()
            .paths(paths)
            .caller_reference(format!("mayoche-{millis}"))
            .build()
            .map_err(|e| invalidate_err(e.to_string()))?;
        let out = self.cloudfront
            .create_invalidation()
            .distribution_id(&self.target.distribution_id)
            .invalidation_batch(batch)
            .send()
            .await
            .map_err(|e| invalidate_err(format!("{:?}", e)))?;
        debug!(
            distribution = %self.target.distribution_id,
            invalidation = out.invalidation().map(|i| i.id()).unwrap_or_default(),
            "created invalidation",
        );
        Ok(())
    }
}

/// uploads in plan order, one at a time. returns how many objects were written.
pub async fn upload_all(sink: &impl AssetSink, uploads: &[PlannedUpload]) -> Result<usize> {
    for upload in uploads {
        let body = tokio::fs::read(&upload.path).await
            .map_err(|source| Error::Io { path: upload.path.clone(), source })?;
        debug!(key = %upload.key, bytes = body.len(), cache_control = upload.cache_class.cache_control(), "uploading");
        sink.put(upload, body).await?;
    }
    info!(objects = uploads.len(), "uploaded frontend assets");
    Ok(uploads.len())
}

/// keys in the bucket that `uploads` does not write, sorted.
pub fn stale_keys(existing: &[String], uploads: &[PlannedUpload]) -> Vec<String> {
    let planned: BTreeSet<&str> = uploads.iter().map(|u| u.key.as_str()).collect();
    let stale: BTreeSet<&String> = existing.iter().filter(|k| !planned.contains(k.as_str())).collect();
    stale.into_iter().cloned().collect()
}

/// deletes every object the plan does not write. returns how many were deleted.
pub async fn prune(sink: &impl AssetSink, uploads: &[PlannedUpload]) -> Result<usize> {
    let stale = stale_keys(&sink.list_keys().await?, uploads);
    for batch in stale.chunks(MAX_DELETE_BATCH) {
        debug!(first = %batch[0], keys = batch.len(), "deleting stale objects");
        sink.delete(batch).await?;
    }
    info!(objects = stale.len(), "pruned stale frontend assets");
    Ok(stale.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub prune: bool,
    pub invalidate: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self { prune: true, invalidate: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishReport {
    pub uploaded: usize,
    pub deleted: usize,
    pub invalidated: bool,
}

/// upload, then prune, then invalidate. nothing is deleted until every
/// upload has succeeded.
pub async fn publish(sink: &impl AssetSink, uploads: &[PlannedUpload], options: PublishOptions) -> Result<PublishReport> {
    let mut report = PublishReport { uploaded: upload_all(sink, uploads).await?, ..Default::default() };
    if options.prune {
        report.deleted = prune(sink, uploads).await?;
    }
    if options.invalidate {
        sink.invalidate(&[INVALIDATE_ALL]).await?;
        report.invalidated = true;
        info!(path = INVALIDATE_ALL, "invalidated distribution");
    }
    Ok(report)
}

async fn stack_output(client: &aws_sdk_cloudformation::Client, stack_name: &str, key: &str) -> Result<String> {
    let stack = aws_cfn_stack::deploy::describe_stack(client, stack_name).await?;
    aws_cfn_stack::deploy::stack_outputs(&stack)
        .remove(key)
        .ok_or_else(|| Error::MissingOutput { stack: stack_name.to_string(), key: key.to_string() })
}

/// the site bucket and distribution of the deployed stack.
pub async fn publish_target(client: &aws_sdk_cloudformation::Client, stack_name: &str) -> Result<PublishTarget> {
    Ok(PublishTarget {
        bucket: stack_output(client, stack_name, FRONTEND_BUCKET_OUTPUT).await?,
        distribution_id: stack_output(client, stack_name, DISTRIBUTION_ID_OUTPUT).await?,
    })
}
