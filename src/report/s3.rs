//! S3 uploads for reports and output files.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use aws_sdk_s3::primitives::ByteStream;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use tracing::info;

/// Serializes a value to JSON and uploads it to an S3 bucket with `application/json` content type.
pub async fn write_json_to_s3(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
    value: &impl Serialize,
) -> Result<()> {
    let body = serde_json::to_vec(value)?;

    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(body.into())
        .content_type("application/json")
        .send()
        .await?;

    Ok(())
}

/// Object key for `path` under `prefix`, with `.gz` appended when compressed.
pub fn object_key(prefix: &str, path: &Path, gzip: bool) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = prefix.trim_matches('/');
    let key = if prefix.is_empty() {
        name
    } else {
        format!("{prefix}/{name}")
    };
    if gzip { format!("{key}.gz") } else { key }
}

pub fn gzip_bytes(contents: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(contents)?;
    Ok(encoder.finish()?)
}

/// Uploads a local file under `prefix`, optionally gzip-compressing it first.
#[tracing::instrument(skip(client), fields(path = %path.display()))]
pub async fn upload_file(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    prefix: &str,
    path: &Path,
    gzip: bool,
) -> Result<String> {
    let contents =
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let body = if gzip { gzip_bytes(&contents)? } else { contents };
    let key = object_key(prefix, path, gzip);

    client
        .put_object()
        .bucket(bucket)
        .key(&key)
        .body(ByteStream::from(body))
        .send()
        .await
        .with_context(|| format!("uploading s3://{bucket}/{key}"))?;

    info!(bucket, key = %key, "Uploaded to S3");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn test_object_key() {
        let path = Path::new("out/predictions.csv");
        assert_eq!(
            object_key("route_deviation/2023-09-12/", path, false),
            "route_deviation/2023-09-12/predictions.csv"
        );
        assert_eq!(object_key("", path, true), "predictions.csv.gz");
    }

    #[test]
    fn test_gzip_bytes_decompresses() {
        let compressed = gzip_bytes(b"plate,date\n").unwrap();
        let mut out = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "plate,date\n");
    }
}
