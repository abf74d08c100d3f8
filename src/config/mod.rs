use crate::error::FloodError;
use std::collections::BTreeMap;
use std::path::Path;
use url::Url;

/// Storage backend flavor. Drives which credential keys a profile must
/// carry: Amazon derives its endpoint from the region, the S3-compatible
/// providers need an explicit one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Amazon,
    Cloudflare,
    Backblaze,
}

impl Provider {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "amazon" => Some(Provider::Amazon),
            "cloudflare" => Some(Provider::Cloudflare),
            "backblaze" => Some(Provider::Backblaze),
            _ => None,
        }
    }

    fn requires_endpoint(self) -> bool {
        !matches!(self, Provider::Amazon)
    }
}

/// A named set of remote-endpoint credentials. Every profile used for a
/// transfer has a resolvable region (and endpoint where the provider needs
/// one); profiles failing validation are rejected at startup, never per-file.
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub provider: Provider,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub endpoint: Option<Url>,
}

/// Immutable-after-startup set of profiles, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Profile>,
}

impl ProfileRegistry {
    /// Parses an AWS-credentials-syntax file into a registry.
    ///
    /// Aborts (via [`FloodError::Config`]) on an empty profile set, a
    /// missing `provider` key, or any provider-required key that is absent.
    pub async fn from_credentials_file(path: &Path) -> Result<Self, FloodError> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            FloodError::Config(format!("cannot read credentials file {}: {e}", path.display()))
        })?;
        Self::from_credentials_str(&contents)
    }

    pub fn from_credentials_str(contents: &str) -> Result<Self, FloodError> {
        let mut sections: Vec<(String, BTreeMap<String, String>)> = Vec::new();

        for raw in contents.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                sections.push((name.trim().to_string(), BTreeMap::new()));
            } else if let Some((key, value)) = line.split_once('=') {
                let Some((_, keys)) = sections.last_mut() else {
                    return Err(FloodError::Config(format!(
                        "credentials entry '{line}' appears before any [profile] header"
                    )));
                };
                keys.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        if sections.is_empty() {
            return Err(FloodError::Config(
                "credentials file contains no profiles".into(),
            ));
        }

        let mut profiles = BTreeMap::new();
        for (name, keys) in sections {
            profiles.insert(name.clone(), Self::build_profile(name, &keys)?);
        }

        Ok(Self { profiles })
    }

    fn build_profile(
        name: String,
        keys: &BTreeMap<String, String>,
    ) -> Result<Profile, FloodError> {
        let require = |key: &str| {
            keys.get(key).cloned().ok_or_else(|| {
                FloodError::Config(format!("profile '{name}' is missing required key '{key}'"))
            })
        };

        let provider_raw = require("provider")?;
        let provider = Provider::parse(&provider_raw).ok_or_else(|| {
            FloodError::Config(format!(
                "profile '{name}' has unknown provider '{provider_raw}'"
            ))
        })?;

        let access_key_id = require("aws_access_key_id")?;
        let secret_access_key = require("aws_secret_access_key")?;
        let region = require("aws_region")?;

        let endpoint = if provider.requires_endpoint() {
            let raw = require("aws_endpoint")?;
            let url = Url::parse(&raw).map_err(|e| {
                FloodError::Config(format!("profile '{name}' has invalid aws_endpoint: {e}"))
            })?;
            Some(url)
        } else {
            keys.get("aws_endpoint")
                .map(|raw| {
                    Url::parse(raw).map_err(|e| {
                        FloodError::Config(format!(
                            "profile '{name}' has invalid aws_endpoint: {e}"
                        ))
                    })
                })
                .transpose()?
        };

        Ok(Profile {
            name,
            provider,
            access_key_id,
            secret_access_key,
            region,
            endpoint,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
[r2-prod]
provider = cloudflare
aws_access_key_id = AKIA123
aws_secret_access_key = secret123
aws_region = auto
aws_endpoint = https://acct.example.r2storage.com

[us-archive]
provider = amazon
aws_access_key_id = AKIA456
aws_secret_access_key = secret456
aws_region = us-east-1
"#;

    #[test]
    fn parses_profiles_with_provider_rules() {
        let registry = ProfileRegistry::from_credentials_str(VALID).unwrap();
        assert_eq!(registry.len(), 2);

        let r2 = registry.get("r2-prod").unwrap();
        assert_eq!(r2.provider, Provider::Cloudflare);
        assert_eq!(r2.region, "auto");
        assert_eq!(
            r2.endpoint.as_ref().unwrap().as_str(),
            "https://acct.example.r2storage.com/"
        );

        let aws = registry.get("us-archive").unwrap();
        assert_eq!(aws.provider, Provider::Amazon);
        assert!(aws.endpoint.is_none());
    }

    #[test]
    fn missing_provider_aborts() {
        let err = ProfileRegistry::from_credentials_str(
            "[p1]\naws_access_key_id = a\naws_secret_access_key = b\naws_region = auto\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("provider"));
    }

    #[test]
    fn cloudflare_without_endpoint_aborts() {
        let err = ProfileRegistry::from_credentials_str(
            "[p1]\nprovider = cloudflare\naws_access_key_id = a\naws_secret_access_key = b\naws_region = auto\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("aws_endpoint"));
    }

    #[test]
    fn empty_file_aborts() {
        assert!(ProfileRegistry::from_credentials_str("\n# nothing here\n").is_err());
    }

    #[test]
    fn unknown_provider_aborts() {
        let err = ProfileRegistry::from_credentials_str(
            "[p1]\nprovider = dropbox\naws_access_key_id = a\naws_secret_access_key = b\naws_region = x\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }
}
