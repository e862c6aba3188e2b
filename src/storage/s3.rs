use super::{
    CopyRequest, ObjectHeaders, ObjectStore, PutRequest, RemoteObject, Tag, TagSet,
    DELETE_BATCH_SIZE,
};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::primitives::{ByteStream, DateTime, DateTimeFormat};
use aws_sdk_s3::types::{
    Delete, MetadataDirective, ObjectCannedAcl, ObjectIdentifier, ServerSideEncryption,
    StorageClass, Tagging,
};
use aws_sdk_s3::Client;

pub struct S3Store {
    client: Client,
    name: String,
}

impl S3Store {
    pub async fn new(endpoint: Option<&str>, region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(ep) = endpoint {
            // 模拟器通常不支持虚拟主机风格的地址
            builder = builder.endpoint_url(ep).force_path_style(true);
        }

        let name = match endpoint {
            Some(ep) => format!("s3+{}", ep),
            None => "s3".to_string(),
        };

        Self {
            client: Client::from_conf(builder.build()),
            name,
        }
    }

    fn parse_expires(value: &str) -> Option<DateTime> {
        DateTime::from_str(value, DateTimeFormat::HttpDate)
            .or_else(|_| DateTime::from_str(value, DateTimeFormat::DateTime))
            .ok()
    }
}

/// CopySource 需要对键做 URL 编码，但保留路径分隔符
fn copy_source(bucket: &str, key: &str) -> String {
    let encoded: Vec<String> = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("{}/{}", bucket, encoded.join("/"))
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_object(&self, request: PutRequest) -> Result<()> {
        let headers = ObjectHeaders::from_params(&request.params);
        let mut builder = self
            .client
            .put_object()
            .bucket(&request.bucket)
            .key(&request.key)
            .acl(ObjectCannedAcl::from(request.acl.as_str()))
            .set_content_type(request.content_type.clone())
            .set_cache_control(headers.cache_control)
            .set_content_disposition(headers.content_disposition)
            .set_content_encoding(headers.content_encoding)
            .set_content_language(headers.content_language)
            .set_website_redirect_location(headers.website_redirect_location);

        if let Some(class) = headers.storage_class.as_deref() {
            builder = builder.storage_class(StorageClass::from(class));
        }
        if let Some(sse) = headers.server_side_encryption.as_deref() {
            builder = builder.server_side_encryption(ServerSideEncryption::from(sse));
        }
        if let Some(expires) = headers.expires.as_deref().and_then(Self::parse_expires) {
            builder = builder.expires(expires);
        }
        for (k, v) in &headers.metadata {
            builder = builder.metadata(k, v);
        }

        let body = ByteStream::from_path(&request.source)
            .await
            .map_err(|e| SyncError::transfer(&request.key, e))?;

        builder
            .content_length(request.size as i64)
            .body(body)
            .send()
            .await
            .map_err(|e| SyncError::transfer(&request.key, DisplayErrorContext(&e)))?;

        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        for chunk in keys.chunks(DELETE_BATCH_SIZE) {
            let objects = chunk
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| SyncError::transfer(key, e))
                })
                .collect::<Result<Vec<_>>>()?;

            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| SyncError::transfer(chunk.join(","), e))?;

            let output = self
                .client
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| SyncError::transfer(chunk.join(","), DisplayErrorContext(&e)))?;

            // 批量删除即使部分失败也返回 200，需要检查 Errors
            if let Some(err) = output.errors().first() {
                return Err(SyncError::transfer(
                    err.key().unwrap_or_default(),
                    err.message().unwrap_or("删除失败"),
                ));
            }
        }
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObject>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| SyncError::transfer(prefix, DisplayErrorContext(&e)))?;

            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(RemoteObject {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    etag: object.e_tag().map(|s| s.trim_matches('"').to_string()),
                });
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn copy_object(&self, request: CopyRequest) -> Result<()> {
        let headers = ObjectHeaders::from_params(&request.params);
        let directive = if request.metadata_replace {
            MetadataDirective::Replace
        } else {
            MetadataDirective::Copy
        };

        let mut builder = self
            .client
            .copy_object()
            .bucket(&request.bucket)
            .key(&request.dest_key)
            .copy_source(copy_source(&request.bucket, &request.source_key))
            .metadata_directive(directive)
            .acl(ObjectCannedAcl::from(request.acl.as_str()))
            .set_content_type(request.content_type.clone())
            .set_cache_control(headers.cache_control)
            .set_content_disposition(headers.content_disposition)
            .set_content_encoding(headers.content_encoding)
            .set_content_language(headers.content_language)
            .set_website_redirect_location(headers.website_redirect_location);

        if let Some(class) = headers.storage_class.as_deref() {
            builder = builder.storage_class(StorageClass::from(class));
        }
        if let Some(sse) = headers.server_side_encryption.as_deref() {
            builder = builder.server_side_encryption(ServerSideEncryption::from(sse));
        }
        if let Some(expires) = headers.expires.as_deref().and_then(Self::parse_expires) {
            builder = builder.expires(expires);
        }
        for (k, v) in &headers.metadata {
            builder = builder.metadata(k, v);
        }

        builder
            .send()
            .await
            .map_err(|e| SyncError::transfer(&request.dest_key, DisplayErrorContext(&e)))?;

        Ok(())
    }

    async fn get_bucket_tags(&self, bucket: &str) -> Result<TagSet> {
        match self.client.get_bucket_tagging().bucket(bucket).send().await {
            Ok(output) => Ok(output
                .tag_set()
                .iter()
                .map(|t| Tag::new(t.key(), t.value()))
                .collect()),
            Err(e) => {
                let service_error = e.into_service_error();
                // 存储桶从未设置过标签
                if service_error.code() == Some("NoSuchTagSet") {
                    Ok(TagSet::new())
                } else {
                    Err(SyncError::tags(bucket, DisplayErrorContext(&service_error)))
                }
            }
        }
    }

    async fn put_bucket_tags(&self, bucket: &str, tags: &TagSet) -> Result<()> {
        let tag_set = tags
            .iter()
            .map(|t| {
                aws_sdk_s3::types::Tag::builder()
                    .key(&t.key)
                    .value(&t.value)
                    .build()
                    .map_err(|e| SyncError::tags(bucket, e))
            })
            .collect::<Result<Vec<_>>>()?;

        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|e| SyncError::tags(bucket, e))?;

        self.client
            .put_bucket_tagging()
            .bucket(bucket)
            .tagging(tagging)
            .send()
            .await
            .map_err(|e| SyncError::tags(bucket, DisplayErrorContext(&e)))?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
