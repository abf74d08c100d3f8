use crate::config::ProfileRegistry;
use crate::services::store::{ObjectStore, S3ObjectStore};
use aws_sdk_s3::config::{Credentials, Region};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Builds one S3 client per profile. Profiles were validated at parse time,
/// so every entry here has a resolvable region and, where its provider
/// needs one, an endpoint.
pub async fn setup_stores(registry: &ProfileRegistry) -> HashMap<String, Arc<dyn ObjectStore>> {
    let mut stores: HashMap<String, Arc<dyn ObjectStore>> = HashMap::new();

    for profile in registry.iter() {
        let mut loader = aws_config::from_env()
            .region(Region::new(profile.region.clone()))
            .credentials_provider(Credentials::new(
                &profile.access_key_id,
                &profile.secret_access_key,
                None,
                None,
                "flood-credentials",
            ));
        if let Some(endpoint) = &profile.endpoint {
            loader = loader.endpoint_url(endpoint.as_str());
        }
        let aws_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_config);

        info!(
            "☁️  Profile '{}': region={} endpoint={}",
            profile.name,
            profile.region,
            profile
                .endpoint
                .as_ref()
                .map_or_else(|| "default".to_string(), |u| u.to_string()),
        );
        stores.insert(profile.name.clone(), Arc::new(S3ObjectStore::new(client)));
    }

    stores
}
