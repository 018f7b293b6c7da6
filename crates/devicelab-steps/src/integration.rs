//! The device integration seam for unmanaged pools.
//!
//! An unmanaged pool delegates device acquisition to an external party. The
//! pool record carries an endpoint URI; the `IntegrationRouter` maps that
//! URI to a registered `DeviceIntegration`, which the `obtainDevices` step
//! invokes once per polling iteration until the requested amount is
//! satisfied.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use devicelab_core::StepError;

/// What `obtainDevices` asks an integration for.
#[derive(Debug, Clone, PartialEq)]
pub struct ObtainRequest {
    pub account: String,
    pub pool_name: String,
    pub provision_id: String,
    /// Devices still missing, not the total requested.
    pub amount: u32,
    pub execution_name: String,
}

/// Devices an integration hands back. May be fewer than asked for; the
/// polling loop will come back for the rest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObtainResponse {
    pub devices: Vec<String>,
}

/// Boxed future returned by an integration call.
pub type ObtainFuture = Pin<Box<dyn Future<Output = Result<ObtainResponse, StepError>> + Send>>;

/// External device source backing an unmanaged pool.
pub trait DeviceIntegration: Send + Sync {
    fn obtain(&self, request: ObtainRequest) -> ObtainFuture;
}

struct FnIntegration<F>(F);

impl<F> DeviceIntegration for FnIntegration<F>
where
    F: Fn(ObtainRequest) -> ObtainFuture + Send + Sync,
{
    fn obtain(&self, request: ObtainRequest) -> ObtainFuture {
        (self.0)(request)
    }
}

/// Wrap an async closure as a shareable integration.
pub fn integration_fn<F, Fut>(f: F) -> Arc<dyn DeviceIntegration>
where
    F: Fn(ObtainRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ObtainResponse, StepError>> + Send + 'static,
{
    Arc::new(FnIntegration(move |request| {
        Box::pin(f(request)) as ObtainFuture
    }))
}

/// Endpoint URI → integration mapping.
#[derive(Default, Clone)]
pub struct IntegrationRouter {
    routes: HashMap<String, Arc<dyn DeviceIntegration>>,
}

impl IntegrationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an integration under an endpoint URI, replacing any
    /// previous registration for that URI.
    pub fn register(&mut self, uri: impl Into<String>, integration: Arc<dyn DeviceIntegration>) {
        self.routes.insert(uri.into(), integration);
    }

    pub fn get(&self, uri: &str) -> Option<Arc<dyn DeviceIntegration>> {
        self.routes.get(uri).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn router_dispatches_by_uri() {
        let mut router = IntegrationRouter::new();
        router.register(
            "lab://vendor-a",
            integration_fn(|request| async move {
                Ok(ObtainResponse {
                    devices: (0..request.amount).map(|i| format!("a-{i}")).collect(),
                })
            }),
        );

        let integration = router.get("lab://vendor-a").unwrap();
        let response = integration
            .obtain(ObtainRequest {
                account: "acct".to_string(),
                pool_name: "ext".to_string(),
                provision_id: "p-1".to_string(),
                amount: 2,
                execution_name: "exec-1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response.devices, vec!["a-0", "a-1"]);

        assert!(router.get("lab://vendor-b").is_none());
    }
}
