//! Variates pool manager.
//!
//! One pool per engine holds standard normal deviates shared by all
//! calculation slots. The pool only grows: a request for more deviates than
//! it holds reallocates it at the next multiple of [`MT_N`], copies the
//! existing deviates forward and appends freshly generated batches, so every
//! deviate keeps its position across growth.

use tracing::debug;

use crate::backend::DeviceBackend;
use crate::error::{ComputeError, ComputeResult};
use crate::rng::MT_N;
use crate::settings::{Precision, Settings};

/// Growable pool of normal deviates living on one device.
pub struct VariatesPool<B: DeviceBackend> {
    size: usize,
    precision: Option<Precision>,
    buffer: Option<B::Buffer>,
    generator: Option<B::Generator>,
}

impl<B: DeviceBackend> Default for VariatesPool<B> {
    fn default() -> Self {
        Self {
            size: 0,
            precision: None,
            buffer: None,
            generator: None,
        }
    }
}

impl<B: DeviceBackend> VariatesPool<B> {
    /// Creates an empty, unseeded pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of deviates held.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Precision fixed by the first growth, if any.
    #[inline]
    pub fn precision(&self) -> Option<Precision> {
        self.precision
    }

    /// Device buffer holding the deviates.
    #[inline]
    pub fn buffer(&self) -> Option<&B::Buffer> {
        self.buffer.as_ref()
    }

    /// Fails if the pool was generated in a precision other than the one
    /// `settings` requests.
    pub fn check_precision(&self, settings: &Settings) -> ComputeResult<()> {
        match self.precision {
            Some(pool) if pool != settings.precision() => {
                Err(ComputeError::VariatesPrecisionMismatch {
                    pool: pool.as_str(),
                    requested: settings.precision().as_str(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Grows the pool to hold at least `required` deviates.
    ///
    /// The generator is seeded from `settings.rng_seed` on the first call
    /// only. Returns `true` if the pool grew.
    pub fn ensure(
        &mut self,
        backend: &mut B,
        required: usize,
        settings: &Settings,
    ) -> ComputeResult<bool> {
        self.check_precision(settings)?;
        if required <= self.size {
            return Ok(false);
        }

        let precision = settings.precision();
        let mut generator = match self.generator.take() {
            Some(generator) => generator,
            None => {
                debug!(seed = settings.rng_seed, %precision, "Seeding variates generator");
                backend.seed_generator(settings.rng_seed, precision)?
            }
        };

        let result = self.grow(backend, &mut generator, required, precision);
        self.generator = Some(generator);
        self.precision = Some(precision);
        result.map(|()| true)
    }

    fn grow(
        &mut self,
        backend: &mut B,
        generator: &mut B::Generator,
        required: usize,
        precision: Precision,
    ) -> ComputeResult<()> {
        let aligned = required.div_ceil(MT_N) * MT_N;
        let mut buffer = backend.allocate(aligned, precision)?;
        if let Some(old) = self.buffer.as_ref() {
            backend.copy_prefix(old, &mut buffer, self.size)?;
        }

        let mut offset = self.size;
        while offset < aligned {
            backend.generate_batch(generator, &mut buffer, offset)?;
            offset += MT_N;
        }
        debug_assert_eq!(offset, aligned);

        debug!(from = self.size, to = aligned, required, "Variates pool grown");
        self.buffer = Some(buffer);
        self.size = aligned;
        Ok(())
    }
}

impl<B: DeviceBackend> std::fmt::Debug for VariatesPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariatesPool")
            .field("size", &self.size)
            .field("precision", &self.precision)
            .field("seeded", &self.generator.is_some())
            .finish()
    }
}
