use dotenv::dotenv;
use std::env;

use object_store::aws::AmazonS3Builder;

/// Builds an S3 client for `bucket` from the environment.
///
/// Credentials and region come from the usual `AWS_*` variables (a `.env`
/// file is honoured). `S3_ENDPOINT` points the client at another S3
/// compatible API such as a local minio.
pub fn builder_from_env(bucket: &str) -> Result<AmazonS3Builder, anyhow::Error> {
    dotenv().ok();

    let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);

    if env::var("AWS_REGION").is_err() && env::var("AWS_DEFAULT_REGION").is_err() {
        log::warn!("AWS_REGION is not set, the S3 client falls back to us-east-1");
    }

    if let Ok(endpoint) = env::var("S3_ENDPOINT") {
        log::info!("using S3 endpoint {}", endpoint);
        builder = builder.with_endpoint(endpoint).with_allow_http(true);
    }

    Ok(builder)
}
