//! Transactional view retriever.
//!
//! The extent cache decides whether an extent is visible or stable for a
//! transaction, and pages extents in when needed. The linkage engine only
//! calls into it through [`ExtentTransViewRetriever`]; resolutions that need
//! it come back as futures.
//!
//! The only recoverable failure anywhere in the linkage layer is an I/O
//! error surfaced by the retriever, see [`ResolveError`].

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::extent::CachedExtent;
use crate::transaction::Transaction;

/// Type-erased handle to a cached extent.
pub type CachedExtentRef = Arc<dyn CachedExtent>;

/// Errors surfaced while resolving a child or parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Reading the extent from backing storage failed.
    InputOutput { message: String },
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputOutput { message } => write!(f, "input/output error: {message}"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Result of a child or parent resolution.
pub type ResolveResult<T> = Result<T, ResolveError>;

/// Transaction-aware access to cached extents.
pub trait ExtentTransViewRetriever: Send + Sync {
    /// Wait until `extent` may be inspected by `t` (e.g. its in-flight
    /// write finished).
    fn maybe_wait_accessible<'a>(
        &'a self,
        t: &'a Transaction,
        extent: &'a dyn CachedExtent,
    ) -> BoxFuture<'a, ResolveResult<()>>;

    /// Whether the version of `extent` that `t` sees has stable data.
    fn is_viewable_extent_data_stable(&self, t: &Transaction, extent: &CachedExtentRef) -> bool;

    /// Whether the version of `extent` that `t` sees is stable.
    fn is_viewable_extent_stable(&self, t: &Transaction, extent: &CachedExtentRef) -> bool;

    /// The version of `extent` visible to `t`, loading it if necessary.
    fn get_extent_viewable_by_trans<'a>(
        &'a self,
        t: &'a Transaction,
        extent: CachedExtentRef,
    ) -> BoxFuture<'a, ResolveResult<CachedExtentRef>>;
}

/// [`ExtentTransViewRetriever::get_extent_viewable_by_trans`] for a concrete
/// extent type.
///
/// # Panics
///
/// The returned future panics if the retriever hands back an extent of a
/// different type.
pub fn get_viewable_as<'a, C>(
    etvr: &'a dyn ExtentTransViewRetriever,
    t: &'a Transaction,
    extent: Arc<C>,
) -> BoxFuture<'a, ResolveResult<Arc<C>>>
where
    C: CachedExtent,
{
    etvr.get_extent_viewable_by_trans(t, extent)
        .map(|res| {
            res.map(|viewable| {
                let Ok(typed) = viewable.into_any().downcast::<C>() else {
                    panic!(
                        "retriever returned an extent of a different type than {}",
                        std::any::type_name::<C>()
                    );
                };
                typed
            })
        })
        .boxed()
}
