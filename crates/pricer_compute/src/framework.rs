//! Registry of compute devices.
//!
//! [`ComputeFramework`] owns one engine per discovered device, keyed by its
//! `backend/platform/device` name. Engines connect lazily the first time
//! their context is requested and are torn down when the framework is
//! dropped.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::backend::{HostBackend, CUDA_PREFIX};
use crate::config::ComputeConfig;
use crate::engine::{ComputeContext, Engine};
use crate::error::{ComputeError, ComputeResult};

/// Device registry handing out [`ComputeContext`]s by name.
///
/// # Examples
///
/// ```rust
/// use pricer_compute::{ComputeConfig, ComputeFramework};
///
/// let mut framework = ComputeFramework::new(&ComputeConfig::default());
/// assert!(framework
///     .available_devices()
///     .contains(&"Host/Rayon/cpu".to_string()));
///
/// let context = framework.context("Host/Rayon/cpu").unwrap();
/// assert!(context.supports_double_precision());
/// ```
pub struct ComputeFramework {
    contexts: BTreeMap<String, Box<dyn ComputeContext>>,
}

impl ComputeFramework {
    /// Discovers the devices enabled by `config`.
    ///
    /// The host backend is always registered; CUDA devices are added when
    /// the `cuda` feature is enabled and a driver is present.
    pub fn new(config: &ComputeConfig) -> Self {
        let retry = config.retry_policy();
        let mut framework = Self::empty();
        framework.register(Box::new(Engine::new(HostBackend::from_config(config), retry)));

        #[cfg(feature = "cuda")]
        for backend in crate::backend::cuda::enumerate() {
            framework.register(Box::new(Engine::new(backend, retry)));
        }

        info!(devices = framework.contexts.len(), "Compute framework created");
        framework
    }

    /// Creates a framework without devices.
    pub fn empty() -> Self {
        Self {
            contexts: BTreeMap::new(),
        }
    }

    /// Registers `context` under its device name, replacing and returning
    /// any context previously registered under that name.
    pub fn register(
        &mut self,
        context: Box<dyn ComputeContext>,
    ) -> Option<Box<dyn ComputeContext>> {
        let name = context.device_name().to_string();
        debug!(device = %name, "Compute device registered");
        self.contexts.insert(name, context)
    }

    /// Names of all registered devices, sorted.
    pub fn available_devices(&self) -> Vec<String> {
        self.contexts.keys().cloned().collect()
    }

    /// Context for device `name`, initialised on first request.
    ///
    /// CUDA names fail with [`ComputeError::BackendUnavailable`] in builds
    /// without the `cuda` feature.
    pub fn context(&mut self, name: &str) -> ComputeResult<&mut dyn ComputeContext> {
        // Checked before `get_mut`: the error needs the other keys, which a
        // borrow returned from the same lookup would still hold.
        if !self.contexts.contains_key(name) {
            if !cfg!(feature = "cuda") && name.starts_with(CUDA_PREFIX) {
                return Err(ComputeError::BackendUnavailable("cuda"));
            }
            return Err(ComputeError::UnknownDevice {
                name: name.to_string(),
                available: self.available_devices(),
            });
        }
        let context = self
            .contexts
            .get_mut(name)
            .ok_or_else(|| ComputeError::UnknownDevice {
                name: name.to_string(),
                available: Vec::new(),
            })?;
        context.init()?;
        Ok(&mut **context)
    }
}

impl Drop for ComputeFramework {
    fn drop(&mut self) {
        debug!(devices = self.contexts.len(), "Tearing down compute framework");
        self.contexts.clear();
    }
}

impl std::fmt::Debug for ComputeFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeFramework")
            .field("devices", &self.available_devices())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;

    #[test]
    fn test_host_device_registered() {
        let framework = ComputeFramework::new(&ComputeConfig::default());
        assert!(framework
            .available_devices()
            .contains(&HostBackend::DEVICE_NAME.to_string()));
    }

    #[test]
    fn test_unknown_device_lists_available() {
        let mut framework = ComputeFramework::empty();
        framework.register(Box::new(Engine::new(
            HostBackend::new(1, true),
            RetryPolicy::no_retry(),
        )));

        match framework.context("OpenCL/Nowhere/gpu") {
            Err(ComputeError::UnknownDevice { name, available }) => {
                assert_eq!(name, "OpenCL/Nowhere/gpu");
                assert_eq!(available, vec!["Host/Rayon/cpu".to_string()]);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("unknown device resolved"),
        }
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_name_without_feature() {
        let mut framework = ComputeFramework::new(&ComputeConfig::default());
        let err = framework.context("CUDA/NVIDIA/missing").map(|_| ()).unwrap_err();
        assert!(matches!(err, ComputeError::BackendUnavailable("cuda")));
        assert!(err.to_string().contains("Rebuild"));
    }

    #[test]
    fn test_context_initialises_lazily() {
        let mut framework = ComputeFramework::empty();
        framework.register(Box::new(Engine::new(
            HostBackend::new(1, false),
            RetryPolicy::no_retry(),
        )));

        let context = framework.context(HostBackend::DEVICE_NAME).unwrap();
        assert!(!context.supports_double_precision());
        assert!(context
            .device_info()
            .iter()
            .any(|(key, _)| key == "host_sizeof(double)"));
    }

    #[test]
    fn test_register_replaces_existing() {
        let mut framework = ComputeFramework::empty();
        let first = framework.register(Box::new(Engine::new(
            HostBackend::new(1, true),
            RetryPolicy::no_retry(),
        )));
        let second = framework.register(Box::new(Engine::new(
            HostBackend::new(2, true),
            RetryPolicy::no_retry(),
        )));
        assert!(first.is_none());
        assert!(second.is_some());
        assert_eq!(framework.available_devices().len(), 1);
    }
}
