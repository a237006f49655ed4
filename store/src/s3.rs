//! S3-compatible backend
//!
//! Every request goes through [`S3Store::call`], which applies the three client-side policies:
//!
//! - at most `pool_size` requests are in flight at once
//! - rate limited responses are retried after a random 1-3s pause, up to the configured budget
//! - when the endpoint cannot be reached and automatic host switching is on, the store moves to
//!   the fallback endpoint for the rest of the run
//!
//! Failures of any other kind are returned as is; deciding whether to try again is up to the
//! caller.

use crate::{
    BucketLayout, CopyOptions, Encryption, Error, GetOptions, ListPage, ListRequest, ObjectMeta,
    ObjectStore, PutOptions, Result, TransferListener, normalize_etag, partial_path,
};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, MetadataDirective, ObjectCannedAcl,
    ServerSideEncryption, StorageClass, TaggingDirective,
};
use futures::{StreamExt, TryStreamExt};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Apply object attributes to any request builder that writes an object
macro_rules! with_put_options {
    ($builder:expr, $options:expr) => {{
        let options: &PutOptions = $options;
        let meta = &options.metadata;
        let mut builder = $builder
            .set_storage_class(options.storage_class.as_deref().map(StorageClass::from))
            .set_acl(options.acl.as_deref().map(ObjectCannedAcl::from))
            .set_grant_read(options.grants.read.clone())
            .set_grant_read_acp(options.grants.read_acp.clone())
            .set_grant_write_acp(options.grants.write_acp.clone())
            .set_grant_full_control(options.grants.full_control.clone())
            .set_tagging(options.tagging.clone())
            .set_content_type(meta.content_type.clone())
            .set_cache_control(meta.cache_control.clone())
            .set_content_disposition(meta.content_disposition.clone())
            .set_content_encoding(meta.content_encoding.clone())
            .set_content_language(meta.content_language.clone());
        if !meta.user.is_empty() {
            builder = builder.set_metadata(Some(meta.user.clone()));
        }
        match &options.encryption {
            Encryption::None => builder,
            Encryption::ServerManaged { algorithm } => {
                builder.server_side_encryption(ServerSideEncryption::from(algorithm.as_str()))
            }
            Encryption::CustomerKey {
                algorithm,
                key,
                key_md5,
            } => builder
                .sse_customer_algorithm(algorithm)
                .sse_customer_key(key)
                .sse_customer_key_md5(key_md5),
        }
    }};
}

/// Customer key headers for requests that read or extend an encrypted object
macro_rules! with_customer_key {
    ($builder:expr, $encryption:expr) => {{
        match $encryption {
            Encryption::CustomerKey {
                algorithm,
                key,
                key_md5,
            } => $builder
                .sse_customer_algorithm(algorithm)
                .sse_customer_key(key)
                .sse_customer_key_md5(key_md5),
            _ => $builder,
        }
    }};
}

/// Map an SDK failure onto the store error kinds
fn classify<E, R>(op: &str, bucket: &str, key: &str, err: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    if matches!(
        err,
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)
    ) {
        return Error::Unreachable {
            op: op.to_string(),
            message: DisplayErrorContext(&err).to_string(),
        };
    }
    match err.code() {
        Some("SlowDown" | "TooManyRequests" | "RequestLimitExceeded" | "ServiceUnavailable") => {
            Error::Throttled { op: op.to_string() }
        }
        Some("NoSuchKey" | "NotFound") => Error::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        _ => Error::Service {
            op: format!("{op} s3://{bucket}/{key}"),
            message: DisplayErrorContext(&err).to_string(),
        },
    }
}

fn body_error(context: String, err: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::io(context, std::io::Error::other(err))
}

fn object_meta(
    key: &str,
    size: Option<i64>,
    last_modified: Option<&aws_sdk_s3::primitives::DateTime>,
    etag: Option<&str>,
) -> ObjectMeta {
    ObjectMeta {
        key: key.to_string(),
        size: size.unwrap_or_default().max(0) as u64,
        last_modified: last_modified.map(|t| t.secs()).unwrap_or_default(),
        etag: etag.map(normalize_etag),
    }
}

/// Connection settings resolved by the session layer
#[derive(Debug, Clone, Default)]
pub struct S3StoreConfig {
    /// maximum number of in-flight requests, `None` for no limit
    pub pool_size: Option<usize>,
    /// retries granted to rate limited requests
    pub throttle_retries: u32,
    /// buckets with a directory-structured namespace
    pub hierarchical_buckets: Vec<String>,
}

#[derive(Debug)]
pub struct S3Store {
    primary: aws_sdk_s3::Client,
    fallback: Option<aws_sdk_s3::Client>,
    switched: AtomicBool,
    pool: Option<tokio::sync::Semaphore>,
    throttle_retries: u32,
    hierarchical_buckets: std::collections::HashSet<String>,
}

impl S3Store {
    pub fn new(
        primary: aws_sdk_s3::Client,
        fallback: Option<aws_sdk_s3::Client>,
        config: S3StoreConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            switched: AtomicBool::new(false),
            pool: config
                .pool_size
                .map(|size| tokio::sync::Semaphore::new(size.max(1))),
            throttle_retries: config.throttle_retries,
            hierarchical_buckets: config.hierarchical_buckets.into_iter().collect(),
        }
    }

    fn client(&self) -> aws_sdk_s3::Client {
        match (&self.fallback, self.switched.load(Ordering::Relaxed)) {
            (Some(fallback), true) => fallback.clone(),
            _ => self.primary.clone(),
        }
    }

    /// Move to the fallback endpoint, returns false if there is none or it is already in use
    fn switch_host(&self) -> bool {
        self.fallback.is_some() && !self.switched.swap(true, Ordering::Relaxed)
    }

    async fn call<T, F, Fut>(&self, op: &str, request: F) -> Result<T>
    where
        F: Fn(aws_sdk_s3::Client) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let _permit = match &self.pool {
            Some(pool) => Some(
                pool.acquire()
                    .await
                    .map_err(|_| Error::Invalid("connection pool closed".to_string()))?,
            ),
            None => None,
        };
        let mut throttled = 0;
        loop {
            match request(self.client()).await {
                Err(Error::Throttled { .. }) if throttled < self.throttle_retries => {
                    throttled += 1;
                    let delay = rand::thread_rng().gen_range(1000..=3000);
                    tracing::debug!("{op}: rate limited, retry {throttled} in {delay}ms");
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                Err(Error::Unreachable { message, .. }) if self.switch_host() => {
                    tracing::warn!("{op}: {message}, switching to the fallback endpoint");
                }
                res => return res,
            }
        }
    }

    async fn head_version(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        encryption: &Encryption,
    ) -> Result<Option<ObjectMeta>> {
        let res = self
            .call("head", |client| async move {
                let req = client
                    .head_object()
                    .bucket(bucket)
                    .key(key)
                    .set_version_id(version_id.map(str::to_string));
                with_customer_key!(req, encryption)
                    .send()
                    .await
                    .map_err(|err| classify("head", bucket, key, err))
            })
            .await;
        match res {
            Ok(out) => Ok(Some(object_meta(
                key,
                out.content_length(),
                out.last_modified(),
                out.e_tag(),
            ))),
            Err(Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        path: &std::path::Path,
        upload_id: &str,
        index: u64,
        part_size: u64,
        size: u64,
        options: &PutOptions,
        listener: &dyn TransferListener,
    ) -> Result<CompletedPart> {
        let offset = index * part_size;
        let length = part_size.min(size - offset);
        let part_number = (index + 1) as i32;
        let output = self
            .call("upload_part", |client| async move {
                let body = ByteStream::read_from()
                    .path(path)
                    .offset(offset)
                    .length(Length::Exact(length))
                    .build()
                    .await
                    .map_err(|err| body_error(format!("failed reading {}", path.display()), err))?;
                let req = client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .content_length(length as i64)
                    .body(body);
                with_customer_key!(req, &options.encryption)
                    .send()
                    .await
                    .map_err(|err| classify("upload_part", bucket, key, err))
            })
            .await?;
        listener.on_bytes(length);
        Ok(CompletedPart::builder()
            .set_e_tag(output.e_tag().map(str::to_string))
            .set_checksum_crc32(output.checksum_crc32().map(str::to_string))
            .part_number(part_number)
            .build())
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        path: &std::path::Path,
        size: u64,
        options: &PutOptions,
        listener: &dyn TransferListener,
    ) -> Result<()> {
        let part_size = options.part.effective_part_size(size);
        let part_count = options.part.part_count(size);
        let created = self
            .call("create_multipart_upload", |client| async move {
                with_put_options!(
                    client.create_multipart_upload().bucket(bucket).key(key),
                    options
                )
                .send()
                .await
                .map_err(|err| classify("create_multipart_upload", bucket, key, err))
            })
            .await?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::Service {
                op: format!("create_multipart_upload s3://{bucket}/{key}"),
                message: "response carries no upload id".to_string(),
            })?
            .to_string();
        let upload_id = upload_id.as_str();
        tracing::debug!(
            "s3://{bucket}/{key}: {part_count} parts of {part_size} bytes, {} at a time",
            options.part.thread_num
        );
        let parts = futures::stream::iter(0..part_count)
            .map(|index| {
                self.upload_part(
                    bucket, key, path, upload_id, index, part_size, size, options, listener,
                )
            })
            .buffer_unordered(options.part.thread_num.max(1))
            .try_collect::<Vec<_>>()
            .await;
        let mut parts = match parts {
            Ok(parts) => parts,
            Err(err) => {
                self.abort_multipart(bucket, key, upload_id).await;
                return Err(err);
            }
        };
        parts.sort_by_key(|part| part.part_number());
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        let completed = &completed;
        let res = self
            .call("complete_multipart_upload", |client| async move {
                let mut req = client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(completed.clone());
                if options.forbid_overwrite {
                    req = req.if_none_match("*");
                }
                req.send()
                    .await
                    .map_err(|err| classify("complete_multipart_upload", bucket, key, err))
            })
            .await;
        if let Err(err) = res {
            self.abort_multipart(bucket, key, upload_id).await;
            return Err(err);
        }
        Ok(())
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) {
        let res = self
            .call("abort_multipart_upload", |client| async move {
                client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                    .map_err(|err| classify("abort_multipart_upload", bucket, key, err))
            })
            .await;
        if let Err(err) = res {
            tracing::warn!("failed to abort upload {upload_id} of s3://{bucket}/{key}: {err}");
        }
    }

    /// Fetch `range` (whole object when `None`) into `partial` starting at `offset`
    #[allow(clippy::too_many_arguments)]
    async fn download_range(
        &self,
        bucket: &str,
        key: &str,
        partial: &std::path::Path,
        offset: u64,
        range: Option<&str>,
        options: &GetOptions,
        listener: &dyn TransferListener,
    ) -> Result<()> {
        let output = self
            .call("get", |client| async move {
                let req = client
                    .get_object()
                    .bucket(bucket)
                    .key(key)
                    .set_version_id(options.version_id.clone())
                    .set_range(range.map(str::to_string));
                with_customer_key!(req, &options.encryption)
                    .send()
                    .await
                    .map_err(|err| classify("get", bucket, key, err))
            })
            .await?;
        let context = || format!("failed writing {}", partial.display());
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(partial)
            .await
            .map_err(|err| Error::io(context(), err))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|err| Error::io(context(), err))?;
        let mut body = output.body;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|err| body_error(format!("failed reading s3://{bucket}/{key}"), err))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|err| Error::io(context(), err))?;
            listener.on_bytes(chunk.len() as u64);
        }
        file.flush().await.map_err(|err| Error::io(context(), err))
    }

    async fn download(
        &self,
        bucket: &str,
        key: &str,
        partial: &std::path::Path,
        meta: &ObjectMeta,
        options: &GetOptions,
        listener: &dyn TransferListener,
    ) -> Result<()> {
        let file = tokio::fs::File::create(partial)
            .await
            .map_err(|err| Error::io(format!("failed creating {}", partial.display()), err))?;
        file.set_len(meta.size)
            .await
            .map_err(|err| Error::io(format!("failed sizing {}", partial.display()), err))?;
        drop(file);
        let part_size = options.part.effective_part_size(meta.size);
        if meta.size <= part_size {
            return self
                .download_range(bucket, key, partial, 0, None, options, listener)
                .await;
        }
        let ranges: Vec<(u64, String)> = (0..options.part.part_count(meta.size))
            .map(|index| {
                let start = index * part_size;
                let end = (start + part_size).min(meta.size) - 1;
                (start, format!("bytes={start}-{end}"))
            })
            .collect();
        let parts: Vec<_> = ranges
            .iter()
            .map(|(start, range)| {
                self.download_range(
                    bucket,
                    key,
                    partial,
                    *start,
                    Some(range.as_str()),
                    options,
                    listener,
                )
            })
            .collect();
        futures::stream::iter(parts)
            .buffer_unordered(options.part.thread_num.max(1))
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    async fn copy_multipart(
        &self,
        copy_source: &str,
        source: &ObjectMeta,
        dst_bucket: &str,
        dst_key: &str,
        options: &CopyOptions,
        listener: &dyn TransferListener,
    ) -> Result<()> {
        let put = &options.put;
        let part_size = put.part.effective_part_size(source.size);
        let created = self
            .call("create_multipart_upload", |client| async move {
                with_put_options!(
                    client
                        .create_multipart_upload()
                        .bucket(dst_bucket)
                        .key(dst_key),
                    put
                )
                .send()
                .await
                .map_err(|err| classify("create_multipart_upload", dst_bucket, dst_key, err))
            })
            .await?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::Service {
                op: format!("create_multipart_upload s3://{dst_bucket}/{dst_key}"),
                message: "response carries no upload id".to_string(),
            })?
            .to_string();
        let upload_id = upload_id.as_str();
        let parts = futures::stream::iter(0..put.part.part_count(source.size))
            .map(|index| async move {
                let start = index * part_size;
                let end = (start + part_size).min(source.size) - 1;
                let range = format!("bytes={start}-{end}");
                let range = range.as_str();
                let part_number = (index + 1) as i32;
                let output = self
                    .call("upload_part_copy", |client| async move {
                        let req = client
                            .upload_part_copy()
                            .bucket(dst_bucket)
                            .key(dst_key)
                            .upload_id(upload_id)
                            .part_number(part_number)
                            .copy_source(copy_source)
                            .copy_source_range(range);
                        let req = match &options.source_encryption {
                            Encryption::CustomerKey {
                                algorithm,
                                key,
                                key_md5,
                            } => req
                                .copy_source_sse_customer_algorithm(algorithm)
                                .copy_source_sse_customer_key(key)
                                .copy_source_sse_customer_key_md5(key_md5),
                            _ => req,
                        };
                        with_customer_key!(req, &put.encryption)
                            .send()
                            .await
                            .map_err(|err| classify("upload_part_copy", dst_bucket, dst_key, err))
                    })
                    .await?;
                listener.on_bytes(end + 1 - start);
                let etag = output
                    .copy_part_result()
                    .and_then(|result| result.e_tag())
                    .map(str::to_string);
                Ok::<_, Error>(
                    CompletedPart::builder()
                        .set_e_tag(etag)
                        .part_number(part_number)
                        .build(),
                )
            })
            .buffer_unordered(put.part.thread_num.max(1))
            .try_collect::<Vec<_>>()
            .await;
        let mut parts = match parts {
            Ok(parts) => parts,
            Err(err) => {
                self.abort_multipart(dst_bucket, dst_key, upload_id).await;
                return Err(err);
            }
        };
        parts.sort_by_key(|part| part.part_number());
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        let completed = &completed;
        let res = self
            .call("complete_multipart_upload", |client| async move {
                client
                    .complete_multipart_upload()
                    .bucket(dst_bucket)
                    .key(dst_key)
                    .upload_id(upload_id)
                    .multipart_upload(completed.clone())
                    .send()
                    .await
                    .map_err(|err| classify("complete_multipart_upload", dst_bucket, dst_key, err))
            })
            .await;
        if let Err(err) = res {
            self.abort_multipart(dst_bucket, dst_key, upload_id).await;
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, bucket: &str, request: &ListRequest) -> Result<ListPage> {
        let output = self
            .call("list", |client| async move {
                let mut req = client
                    .list_objects_v2()
                    .bucket(bucket)
                    .prefix(&request.prefix)
                    .set_continuation_token(request.marker.clone());
                if !request.delimiter.is_empty() {
                    req = req.delimiter(&request.delimiter);
                }
                if request.max_keys > 0 {
                    req = req.max_keys(request.max_keys);
                }
                req.send()
                    .await
                    .map_err(|err| classify("list", bucket, &request.prefix, err))
            })
            .await?;
        let objects = output
            .contents()
            .iter()
            .map(|object| {
                object_meta(
                    object.key().unwrap_or_default(),
                    object.size(),
                    object.last_modified(),
                    object.e_tag(),
                )
            })
            .collect();
        let common_prefixes = output
            .common_prefixes()
            .iter()
            .filter_map(|prefix| prefix.prefix())
            .map(str::to_string)
            .collect();
        let next_marker = match output.is_truncated() {
            Some(true) => output.next_continuation_token().map(str::to_string),
            _ => None,
        };
        Ok(ListPage {
            objects,
            common_prefixes,
            next_marker,
        })
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        self.head_version(bucket, key, None, &Encryption::None).await
    }

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &std::path::Path,
        options: &PutOptions,
        listener: &dyn TransferListener,
    ) -> Result<()> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|err| Error::io(format!("failed reading {}", path.display()), err))?
            .len();
        if size > options.part.effective_part_size(size) {
            return self
                .put_multipart(bucket, key, path, size, options, listener)
                .await;
        }
        self.call("put", |client| async move {
            let body = ByteStream::from_path(path)
                .await
                .map_err(|err| body_error(format!("failed reading {}", path.display()), err))?;
            let mut req = with_put_options!(
                client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .content_length(size as i64)
                    .body(body),
                options
            );
            if options.forbid_overwrite {
                req = req.if_none_match("*");
            }
            req.send()
                .await
                .map_err(|err| classify("put", bucket, key, err))
        })
        .await?;
        listener.on_bytes(size);
        Ok(())
    }

    async fn put_empty(&self, bucket: &str, key: &str, options: &PutOptions) -> Result<()> {
        self.call("put", |client| async move {
            let mut req = with_put_options!(
                client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .body(ByteStream::from_static(b"")),
                options
            );
            if options.forbid_overwrite {
                req = req.if_none_match("*");
            }
            req.send()
                .await
                .map_err(|err| classify("put", bucket, key, err))
        })
        .await?;
        Ok(())
    }

    async fn get_to_file(
        &self,
        bucket: &str,
        key: &str,
        path: &std::path::Path,
        options: &GetOptions,
        listener: &dyn TransferListener,
    ) -> Result<ObjectMeta> {
        let meta = self
            .head_version(
                bucket,
                key,
                options.version_id.as_deref(),
                &options.encryption,
            )
            .await?
            .ok_or_else(|| Error::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        let partial = partial_path(path);
        if let Err(err) = self
            .download(bucket, key, &partial, &meta, options, listener)
            .await
        {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                tracing::debug!("failed removing {}: {}", partial.display(), cleanup);
            }
            return Err(err);
        }
        tokio::fs::rename(&partial, path)
            .await
            .map_err(|err| Error::io(format!("failed renaming into {}", path.display()), err))?;
        Ok(meta)
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        options: &CopyOptions,
        listener: &dyn TransferListener,
    ) -> Result<()> {
        let source = self
            .head_version(
                src_bucket,
                src_key,
                options.source_version_id.as_deref(),
                &options.source_encryption,
            )
            .await?
            .ok_or_else(|| Error::NotFound {
                bucket: src_bucket.to_string(),
                key: src_key.to_string(),
            })?;
        if options.put.forbid_overwrite && self.head(dst_bucket, dst_key).await?.is_some() {
            return Err(Error::Service {
                op: format!("copy s3://{dst_bucket}/{dst_key}"),
                message: "destination exists and overwriting is forbidden".to_string(),
            });
        }
        let mut copy_source = format!("{}/{}", src_bucket, urlencoding::encode(src_key));
        if let Some(version_id) = &options.source_version_id {
            copy_source.push_str("?versionId=");
            copy_source.push_str(version_id);
        }
        let copy_source = copy_source.as_str();
        let put = &options.put;
        if source.size > put.part.effective_part_size(source.size) {
            return self
                .copy_multipart(copy_source, &source, dst_bucket, dst_key, options, listener)
                .await;
        }
        self.call("copy", |client| async move {
            let mut req = with_put_options!(
                client
                    .copy_object()
                    .bucket(dst_bucket)
                    .key(dst_key)
                    .copy_source(copy_source),
                put
            );
            if !put.metadata.is_empty() {
                req = req.metadata_directive(MetadataDirective::Replace);
            }
            if put.tagging.is_some() {
                req = req.tagging_directive(TaggingDirective::Replace);
            }
            if let Encryption::CustomerKey {
                algorithm,
                key,
                key_md5,
            } = &options.source_encryption
            {
                req = req
                    .copy_source_sse_customer_algorithm(algorithm)
                    .copy_source_sse_customer_key(key)
                    .copy_source_sse_customer_key_md5(key_md5);
            }
            req.send()
                .await
                .map_err(|err| classify("copy", dst_bucket, dst_key, err))
        })
        .await?;
        listener.on_bytes(source.size);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let res = self
            .call("delete", |client| async move {
                client
                    .delete_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|err| classify("delete", bucket, key, err))
            })
            .await;
        match res {
            Ok(_) | Err(Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn bucket_layout(&self, bucket: &str) -> Result<BucketLayout> {
        if self.hierarchical_buckets.contains(bucket) {
            return Ok(BucketLayout::Hierarchical);
        }
        Ok(BucketLayout::Flat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_client() -> aws_sdk_s3::Client {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .endpoint_url("http://127.0.0.1:9")
            .retry_config(aws_sdk_s3::config::retry::RetryConfig::disabled())
            .build();
        aws_sdk_s3::Client::from_conf(config)
    }

    #[tokio::test]
    async fn throttled_calls_are_retried_within_budget() {
        let store = S3Store::new(
            offline_client(),
            None,
            S3StoreConfig {
                throttle_retries: 0,
                ..Default::default()
            },
        );
        let calls = std::sync::atomic::AtomicU32::new(0);
        let res: Result<()> = store
            .call("test", |_client| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::Throttled {
                        op: "test".to_string(),
                    })
                }
            })
            .await;
        assert!(matches!(res, Err(Error::Throttled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_endpoint_switches_once() {
        let store = S3Store::new(
            offline_client(),
            Some(offline_client()),
            S3StoreConfig::default(),
        );
        let calls = std::sync::atomic::AtomicU32::new(0);
        let res: Result<()> = store
            .call("test", |_client| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::Unreachable {
                        op: "test".to_string(),
                        message: "connection refused".to_string(),
                    })
                }
            })
            .await;
        assert!(res.is_err());
        // one attempt on the primary, one on the fallback
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(store.switched.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn ranged_download_reports_failed_parts() {
        let store = S3Store::new(offline_client(), None, S3StoreConfig::default());
        let tmp = tempfile::tempdir().unwrap();
        let partial = tmp.path().join("big.bin.partial");
        let meta = ObjectMeta {
            key: "big.bin".to_string(),
            size: 10 * 1024,
            last_modified: 0,
            etag: None,
        };
        let options = GetOptions {
            part: crate::PartPolicy {
                part_size: 1024,
                thread_num: 4,
            },
            ..Default::default()
        };
        let res = store
            .download("bkt", "big.bin", &partial, &meta, &options, &crate::NoProgress)
            .await;
        assert!(res.is_err());
        // the file was sized up front for the parts to land in
        assert_eq!(std::fs::metadata(&partial).unwrap().len(), 10 * 1024);
    }

    #[tokio::test]
    async fn configured_buckets_are_hierarchical() {
        let store = S3Store::new(
            offline_client(),
            None,
            S3StoreConfig {
                hierarchical_buckets: vec!["ofs".to_string()],
                ..Default::default()
            },
        );
        assert_eq!(
            store.bucket_layout("ofs").await.unwrap(),
            BucketLayout::Hierarchical
        );
        assert_eq!(store.bucket_layout("flat").await.unwrap(), BucketLayout::Flat);
    }
}
