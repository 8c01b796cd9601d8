//! Shared mutable model parameters.
//!
//! The surrounding inference engine owns parameter values and mutates them
//! between likelihood evaluations. Providers in this crate hold `Arc`s to the
//! parameters they are bound to and detect changes through a monotone version
//! counter, which replaces the listener protocol of a full model framework:
//! a cache is valid exactly while every version it was built under is
//! unchanged.

use ndarray::Array1;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A named vector of doubles with interior mutability and change tracking.
///
/// Reads may happen concurrently (worker threads snapshot values during a
/// parallel reduction); writes are expected only from the single thread
/// driving the sampler, between evaluations.
pub struct Parameter {
    label: String,
    dimension: usize,
    values: RwLock<Vec<f64>>,
    version: AtomicU64,
}

impl Parameter {
    pub fn new(label: impl Into<String>, values: Vec<f64>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            dimension: values.len(),
            values: RwLock::new(values),
            version: AtomicU64::new(0),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Dimension is fixed at construction; `set_values` cannot resize.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn value(&self, index: usize) -> f64 {
        self.values.read().unwrap()[index]
    }

    /// Snapshot of the current values.
    pub fn values(&self) -> Vec<f64> {
        self.values.read().unwrap().clone()
    }

    pub fn as_array(&self) -> Array1<f64> {
        Array1::from_vec(self.values())
    }

    pub fn set_value(&self, index: usize, value: f64) {
        self.values.write().unwrap()[index] = value;
        self.bump();
    }

    pub fn set_values(&self, values: &[f64]) {
        let mut guard = self.values.write().unwrap();
        assert_eq!(
            values.len(),
            self.dimension,
            "parameter `{}` has fixed dimension {}",
            self.label,
            self.dimension
        );
        guard.copy_from_slice(values);
        drop(guard);
        self.bump();
    }

    /// Monotone counter bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("label", &self.label)
            .field("dimension", &self.dimension)
            .field("version", &self.version())
            .finish()
    }
}

/// Scoped elementary-vector probe of a parameter.
///
/// Column extraction works by temporarily overwriting the bound data
/// parameter with a basis vector and pushing it through the product
/// provider. The original values are captured on entry and restored on every
/// exit path, including unwinding, so a failed probe cannot leave the model
/// in a corrupted state. Concurrent probes of the same parameter are not
/// supported; the column providers take `&mut self` to enforce a single
/// calling thread.
pub struct ProbeGuard<'a> {
    parameter: &'a Parameter,
    saved: Vec<f64>,
}

impl<'a> ProbeGuard<'a> {
    /// Overwrite `parameter` with the basis vector `e_index`.
    pub fn basis(parameter: &'a Parameter, index: usize) -> Self {
        let saved = parameter.values();
        let mut probe = vec![0.0; parameter.dimension()];
        probe[index] = 1.0;
        parameter.set_values(&probe);
        Self { parameter, saved }
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.parameter.set_values(&self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_counts_mutations() {
        let p = Parameter::new("loadings", vec![1.0, 2.0, 3.0]);
        assert_eq!(p.version(), 0);
        p.set_value(1, -2.0);
        p.set_values(&[0.0, 0.0, 0.0]);
        assert_eq!(p.version(), 2);
    }

    #[test]
    fn probe_guard_restores_values() {
        let p = Parameter::new("data", vec![0.5, 1.5, 2.5]);
        {
            let _probe = ProbeGuard::basis(&p, 2);
            assert_eq!(p.values(), vec![0.0, 0.0, 1.0]);
        }
        assert_eq!(p.values(), vec![0.5, 1.5, 2.5]);
    }

    #[test]
    fn probe_guard_restores_on_unwind() {
        let p = Parameter::new("data", vec![1.0, 2.0]);
        let result = std::panic::catch_unwind(|| {
            let _probe = ProbeGuard::basis(&p, 0);
            panic!("probe failed");
        });
        assert!(result.is_err());
        assert_eq!(p.values(), vec![1.0, 2.0]);
    }
}
