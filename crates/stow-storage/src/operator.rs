//! OpenDAL Operator factory: one operator per storage policy

use anyhow::Context;
use opendal::Operator;
use std::sync::Arc;
use stow_core::{BackendKind, Policy, StowError, StowResult};

use crate::backend::OpendalHandler;
use crate::handler::{HandlerFactory, StorageHandler};

/// S3 credentials shared by every S3 policy
#[derive(Debug, Clone, Default)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Build an OpenDAL Operator for the backend a policy names.
///
/// Local policies are rooted at `/` so that the absolute destinations
/// produced by `Policy::destination` land where the reconciler walks. A
/// relative `dir_name_rule` is refused for them, since the walk would
/// resolve it against the working directory instead.
/// S3 uses path-style addressing (the opendal default), which works with
/// SeaweedFS and MinIO as well as AWS.
pub fn build_operator(policy: &Policy, creds: Option<&S3Credentials>) -> anyhow::Result<Operator> {
    let op = match policy.backend {
        BackendKind::Local => {
            let base = policy.generate_path(0, "/");
            if !base.starts_with('/') {
                anyhow::bail!(
                    "local policy {} needs an absolute dir_name_rule, got {:?}",
                    policy.id,
                    policy.dir_name_rule
                );
            }
            Operator::new(opendal::services::Fs::default().root("/"))
                .context("creating OpenDAL fs operator")?
                .finish()
        }
        BackendKind::Memory => Operator::new(opendal::services::Memory::default())
            .context("creating OpenDAL memory operator")?
            .finish(),
        BackendKind::S3 => {
            let creds = creds.context("S3 policy requires credentials")?;
            let endpoint = policy
                .server
                .as_deref()
                .context("S3 policy has no server endpoint")?;
            let bucket = policy
                .bucket
                .as_deref()
                .context("S3 policy has no bucket")?;

            let builder = opendal::services::S3::default()
                .endpoint(endpoint)
                .region(policy.region.as_deref().unwrap_or("us-east-1"))
                .bucket(bucket)
                .access_key_id(&creds.access_key_id)
                .secret_access_key(&creds.secret_access_key);

            Operator::new(builder)
                .context("creating OpenDAL S3 operator")?
                .layer(
                    opendal::layers::RetryLayer::new()
                        .with_max_times(5)
                        .with_jitter(),
                )
                .finish()
        }
    };

    Ok(op.layer(opendal::layers::LoggingLayer::default()))
}

/// HandlerFactory that wraps each policy's operator in an `OpendalHandler`.
#[derive(Debug, Clone, Default)]
pub struct OpendalFactory {
    /// Reject S3 policies with plaintext HTTP endpoints
    pub enforce_tls: bool,
    pub credentials: Option<S3Credentials>,
}

impl OpendalFactory {
    pub fn new(enforce_tls: bool, credentials: Option<S3Credentials>) -> Self {
        Self {
            enforce_tls,
            credentials,
        }
    }

    /// Read credentials from the named environment variables, if both are set.
    pub fn credentials_from_env(access_key_env: &str, secret_key_env: &str) -> Option<S3Credentials> {
        let access_key_id = std::env::var(access_key_env).ok()?;
        let secret_access_key = std::env::var(secret_key_env).ok()?;
        Some(S3Credentials {
            access_key_id,
            secret_access_key,
        })
    }

    fn check_endpoint(&self, policy: &Policy) -> StowResult<()> {
        let Some(endpoint) = policy.server.as_deref() else {
            return Ok(());
        };
        if policy.backend != BackendKind::S3 || !endpoint.starts_with("http://") {
            return Ok(());
        }
        if self.enforce_tls {
            return Err(StowError::Config(format!(
                "policy {} uses plaintext HTTP endpoint {endpoint} but enforce_tls is enabled",
                policy.id
            )));
        }
        tracing::warn!(
            policy = policy.id,
            endpoint = %endpoint,
            "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
        );
        Ok(())
    }

    /// The operator backing `policy`, after the endpoint checks.
    pub fn operator_for(&self, policy: &Policy) -> StowResult<Operator> {
        self.check_endpoint(policy)?;
        build_operator(policy, self.credentials.as_ref())
            .map_err(|e| StowError::Config(format!("policy {}: {e:#}", policy.id)))
    }
}

impl HandlerFactory for OpendalFactory {
    fn handler_for(&self, policy: &Policy) -> StowResult<Arc<dyn StorageHandler>> {
        let op = self.operator_for(policy)?;
        Ok(Arc::new(OpendalHandler::new(op)))
    }
}
