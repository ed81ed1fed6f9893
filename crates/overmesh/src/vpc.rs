//! Cloud-provider VPC route injection
//!
//! The control plane hands an edge its CSP credentials at registration; the
//! edge then asks the provider to point the VPC route table at itself for
//! every peer subnet. The concrete provider SDK calls live outside this
//! crate; the core consumes a single capability.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{MeshError, Result};
use crate::protocol::CspInfo;

/// The one capability the data plane needs from a cloud provider
#[async_trait]
pub trait VpcRouter: Send + Sync {
    /// Program a VPC route for `cidr` pointing at this instance
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects the route. Callers treat this
    /// as best-effort: local connectivity proceeds regardless.
    async fn create_route(&self, cidr: &str) -> Result<()>;

    /// Provider identifier, for logs
    fn provider(&self) -> &str;
}

/// Route injector that acknowledges without programming anything
///
/// Stands in when no provider is configured, and carries the provider tag so
/// logs still show which CSP the deployment declared.
pub struct NoopVpc {
    provider: String,
}

impl NoopVpc {
    /// Create a no-op injector tagged with a provider name
    #[must_use]
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }
}

#[async_trait]
impl VpcRouter for NoopVpc {
    async fn create_route(&self, cidr: &str) -> Result<()> {
        tracing::debug!(provider = %self.provider, cidr = %cidr, "vpc route injection skipped");
        Ok(())
    }

    fn provider(&self) -> &str {
        &self.provider
    }
}

/// Supported provider identifiers
const KNOWN_PROVIDERS: &[&str] = &["ali-vpc", "aws-vpc"];

/// Build the injector for the CSP credentials handed down at registration
///
/// # Errors
///
/// Returns a config error for a provider this build does not know.
pub fn vpc_for(info: &CspInfo) -> Result<Arc<dyn VpcRouter>> {
    if KNOWN_PROVIDERS.contains(&info.csp_type.as_str()) {
        Ok(Arc::new(NoopVpc::new(info.csp_type.clone())))
    } else {
        Err(MeshError::config(format!(
            "unsupported vpc provider: {}",
            info.csp_type
        )))
    }
}
