//! Join token generation and cluster secret access
//!
//! Every cluster has one shared join token all machines present to the init
//! node. The token is generated once, persisted in a Secret next to the
//! cluster object, and folded into every machine's runtime config by the
//! plan generator.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, PostParams};
use kube::Client;
use std::collections::BTreeMap;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Secret key holding the join token
const TOKEN_KEY: &str = "token";

/// A cluster join token
#[derive(Clone)]
pub struct JoinToken {
    raw: Vec<u8>,
    string: String,
}

impl JoinToken {
    /// Generate a new random join token
    pub fn generate() -> Self {
        // aws-lc-rs for FIPS-compliant random generation
        let mut raw = vec![0u8; 32];
        aws_lc_rs::rand::fill(&mut raw).expect("random generation failed");

        let string = URL_SAFE_NO_PAD.encode(&raw);
        Self { raw, string }
    }

    /// Get the token as a string
    pub fn as_str(&self) -> &str {
        &self.string
    }

    /// Get a SHA-256 hash of the token (for logging without exposure)
    pub fn hash(&self) -> String {
        use aws_lc_rs::digest::{digest, SHA256};
        let hash = digest(&SHA256, &self.raw);
        URL_SAFE_NO_PAD.encode(hash.as_ref())
    }
}

impl std::fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose the actual token in debug output
        f.debug_struct("JoinToken").field("hash", &self.hash()).finish()
    }
}

/// Credentials for an S3 snapshot target
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct S3Credentials {
    /// Access key id
    pub access_key: String,
    /// Secret access key
    pub secret_key: String,
}

/// Trait abstracting the cluster's secret material
///
/// Allows mocking secret access in tests while using the real Secret API in
/// production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterSecrets: Send + Sync {
    /// Fetch the cluster's join token, creating it on first use
    async fn ensure_join_token(&self, namespace: &str, cluster_name: &str)
        -> Result<String, Error>;

    /// Fetch S3 credentials from the named cloud-credential Secret
    async fn s3_credentials(
        &self,
        namespace: &str,
        secret_name: &str,
    ) -> Result<S3Credentials, Error>;
}

/// Real secret access backed by the Kubernetes Secret API
pub struct SecretClusterSecrets {
    client: Client,
}

impl SecretClusterSecrets {
    /// Create a new client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn string_data(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
}

#[async_trait]
impl ClusterSecrets for SecretClusterSecrets {
    async fn ensure_join_token(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<String, Error> {
        let api = self.api(namespace);
        let secret_name = format!("{cluster_name}-join-token");

        if let Some(existing) = api.get_opt(&secret_name).await? {
            return string_data(&existing, TOKEN_KEY).ok_or_else(|| {
                Error::decode(TOKEN_KEY, format!("secret {secret_name} has no token key"))
            });
        }

        let token = JoinToken::generate();
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(secret_name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            string_data: Some(BTreeMap::from([(
                TOKEN_KEY.to_string(),
                token.as_str().to_string(),
            )])),
            ..Default::default()
        };

        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(token.as_str().to_string()),
            // Lost a create race with another pass; read the winner
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let existing = api.get(&secret_name).await?;
                string_data(&existing, TOKEN_KEY).ok_or_else(|| {
                    Error::decode(TOKEN_KEY, format!("secret {secret_name} has no token key"))
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn s3_credentials(
        &self,
        namespace: &str,
        secret_name: &str,
    ) -> Result<S3Credentials, Error> {
        let secret = self.api(namespace).get(secret_name).await?;

        let access_key = string_data(&secret, "accessKey")
            .ok_or_else(|| Error::decode("accessKey", format!("missing in {secret_name}")))?;
        let secret_key = string_data(&secret, "secretKey")
            .ok_or_else(|| Error::decode("secretKey", format!("missing in {secret_name}")))?;

        Ok(S3Credentials {
            access_key,
            secret_key,
        })
    }
}
