//! Application state shared across request handlers and workers.

use std::sync::Arc;

use crate::config::Config;
use crate::db::{Database, NodeLogStore, NodeStore, Outbox};
use crate::identity::{CheckinProcessor, IdentityResolver, NodeLifecycle, PolicyBinder};
use crate::policy::PolicyCatalogue;
use crate::power::{ManagementChannel, PowerReconciler};
use crate::tags::TagMatcher;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
/// The collaborator seams (tag matcher, policy catalogue, management
/// channel) are injected here, which is also how tests swap them out.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    db: Database,
    store: NodeStore,
    log: NodeLogStore,
    outbox: Outbox,
    resolver: IdentityResolver,
    checkin: CheckinProcessor,
    lifecycle: NodeLifecycle,
    power: PowerReconciler,
}

impl AppState {
    /// Wire up the service graph.
    pub fn new(
        db: Database,
        config: &Config,
        matcher: Arc<dyn TagMatcher>,
        catalogue: Arc<dyn PolicyCatalogue>,
        channel: Arc<dyn ManagementChannel>,
    ) -> Self {
        let pool = db.pool().clone();
        let store = NodeStore::new(pool.clone(), config.matching.clone());
        let log = NodeLogStore::new(pool.clone());
        let outbox = Outbox::new(pool);
        let binder = PolicyBinder::new(matcher, catalogue.clone());

        let resolver = IdentityResolver::new(
            db.clone(),
            store.clone(),
            log.clone(),
            config.matching.clone(),
            config.protect_new_nodes,
        );
        let checkin = CheckinProcessor::new(
            db.clone(),
            store.clone(),
            log.clone(),
            binder,
            catalogue.clone(),
            config.matching.clone(),
            config.facts_blacklist.clone(),
        );
        let lifecycle = NodeLifecycle::new(
            db.clone(),
            store.clone(),
            log.clone(),
            outbox.clone(),
            catalogue,
        );
        let power = PowerReconciler::new(
            db.clone(),
            store.clone(),
            log.clone(),
            outbox.clone(),
            channel,
        );

        Self {
            inner: Arc::new(AppStateInner {
                db,
                store,
                log,
                outbox,
                resolver,
                checkin,
                lifecycle,
                power,
            }),
        }
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn store(&self) -> &NodeStore {
        &self.inner.store
    }

    pub fn log(&self) -> &NodeLogStore {
        &self.inner.log
    }

    pub fn outbox(&self) -> &Outbox {
        &self.inner.outbox
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.inner.resolver
    }

    pub fn checkin(&self) -> &CheckinProcessor {
        &self.inner.checkin
    }

    pub fn lifecycle(&self) -> &NodeLifecycle {
        &self.inner.lifecycle
    }

    pub fn power(&self) -> &PowerReconciler {
        &self.inner.power
    }
}
