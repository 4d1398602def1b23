//! Packages and the handler contract

use std::ops::Deref;
use tracing::Span;

use crate::error::{BoxError, Error};

/// A batch of items formed from the intake queue, in enqueue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package<T> {
    id: u64,
    items: Vec<T>,
}

impl<T> Package<T> {
    pub(crate) fn new(id: u64, items: Vec<T>) -> Self {
        Self { id, items }
    }

    /// Sequence number assigned when the package was formed.
    ///
    /// Packages reach the processing queue in id order.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Items of this package
    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Take ownership of the items
    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

impl<T> Deref for Package<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

/// Terminal processing of a package, typically one bulk write.
///
/// Called on a worker thread with the connection source the processor was
/// built with and the span the worker opened for this package. The package
/// is never empty. A package is not retried after an error, so handlers must
/// be safe under at-least-once delivery.
///
/// Any `Fn(&S, &Package<T>, &Span) -> Result<(), BoxError>` closure is a
/// handler.
pub trait PackageHandler<T, S>: Send + Sync + 'static {
    /// Process one package
    fn handle(&self, source: &S, package: &Package<T>, span: &Span) -> Result<(), BoxError>;
}

impl<T, S, F> PackageHandler<T, S> for F
where
    F: Fn(&S, &Package<T>, &Span) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn handle(&self, source: &S, package: &Package<T>, span: &Span) -> Result<(), BoxError> {
        self(source, package, span)
    }
}

/// Report of a package whose handler failed or panicked
#[derive(Debug)]
pub struct PackageFailure {
    /// Id of the failed package
    pub package_id: u64,
    /// Number of items in the failed package
    pub items: usize,
    /// What went wrong
    pub error: Error,
}
