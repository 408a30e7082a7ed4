//! Transactions as seen by the linkage layer.
//!
//! The linkage code only needs a transaction's id and a place to hang
//! per-transaction state that must disappear when the transaction ends.
//!
//! # Design
//!
//! - Views are registered with [`Transaction::add_transactional_view`]
//! - When the transaction is dropped (commit or abort), each view's
//!   [`TransactionalView::on_transaction_end`] runs exactly once
//! - Views hold weak references to whatever they hang off, so a transaction
//!   never keeps a stable node alive

use std::sync::{Arc, Mutex};

use crate::lock;

/// Transaction identifier.
pub type TransId = u64;

/// Per-transaction state owned by some long-lived object.
pub trait TransactionalView: Send + Sync {
    /// The transaction this view belongs to.
    fn trans_id(&self) -> TransId;

    /// Detach the view from its owner. Called once, when the transaction ends.
    fn on_transaction_end(&self);
}

/// A transaction handle.
pub struct Transaction {
    trans_id: TransId,
    views: Mutex<Vec<Arc<dyn TransactionalView>>>,
}

impl Transaction {
    /// Begin a transaction with the given id.
    #[must_use]
    pub const fn new(trans_id: TransId) -> Self {
        Self {
            trans_id,
            views: Mutex::new(Vec::new()),
        }
    }

    /// Get the transaction ID.
    #[must_use]
    pub const fn trans_id(&self) -> TransId {
        self.trans_id
    }

    /// Register a view to be torn down when this transaction ends.
    ///
    /// # Panics
    ///
    /// Panics if the view belongs to a different transaction.
    pub fn add_transactional_view<V>(&self, view: Arc<V>) -> Arc<V>
    where
        V: TransactionalView + 'static,
    {
        assert_eq!(
            view.trans_id(),
            self.trans_id,
            "view registered with the wrong transaction"
        );
        lock(&self.views).push(Arc::clone(&view) as Arc<dyn TransactionalView>);
        view
    }

    /// Number of views currently registered.
    #[must_use]
    pub fn view_count(&self) -> usize {
        lock(&self.views).len()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("trans_id", &self.trans_id)
            .field("views", &self.view_count())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // Take the views out first: tearing one down locks its owner, and
        // owners may register further views while we run.
        let views = std::mem::take(
            self.views
                .get_mut()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        tracing::trace!(
            "trans.{} ending, tearing down {} views",
            self.trans_id,
            views.len()
        );
        for view in views {
            view.on_transaction_end();
        }
    }
}
