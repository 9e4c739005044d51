//! Wires the components together from a [`Config`].

use crate::auth::{SessionContext, SessionStorage};
use crate::authorization::AuthorizationSequencer;
use crate::config::Config;
use crate::conversation::{ControlSignal, ConversationObserver, ConversationStore};
use crate::error::Result;
use crate::gateway::{HttpTransport, RequestGateway, Transport};
use crate::workflow::WorkflowSessionCache;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Feeds authorization signals from replies into the sequencer.
struct SequencerFeed {
    sequencer: Arc<Mutex<AuthorizationSequencer>>,
}

impl ConversationObserver for SequencerFeed {
    fn on_signal(&self, conversation_id: &str, signal: &ControlSignal) {
        if let ControlSignal::AuthorizationRequired(requests) = signal {
            let added = lock_sequencer(&self.sequencer).enqueue(requests.iter().cloned());
            debug!(conversation_id, added, "authorization requirements queued");
        }
    }
}

fn lock_sequencer(
    sequencer: &Mutex<AuthorizationSequencer>,
) -> MutexGuard<'_, AuthorizationSequencer> {
    sequencer.lock().unwrap_or_else(|poisoned| {
        warn!("authorization sequencer lock poisoned, recovering");
        PoisonError::into_inner(poisoned)
    })
}

/// Everything a front end needs, sharing one session.
pub struct Client {
    session: Arc<SessionContext>,
    gateway: RequestGateway,
    store: ConversationStore,
    sequencer: Arc<Mutex<AuthorizationSequencer>>,
    cache: Arc<WorkflowSessionCache>,
}

impl Client {
    /// Build from config with durable session storage and plan cache.
    pub fn from_config(config: &Config) -> Result<Self> {
        let session = Arc::new(SessionContext::with_storage(SessionStorage::new(
            config.session_path(),
        ))?);
        let cache = Arc::new(WorkflowSessionCache::open(&config.workflow_db_path())?);
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.request_timeout()));
        Ok(Self::with_parts(config, transport, session, cache))
    }

    pub fn with_parts(
        config: &Config,
        transport: Arc<dyn Transport>,
        session: Arc<SessionContext>,
        cache: Arc<WorkflowSessionCache>,
    ) -> Self {
        let gateway = RequestGateway::new(config.gateway(), transport, Arc::clone(&session));
        let store = ConversationStore::builder(gateway.clone())
            .options(config.store())
            .cache(Arc::clone(&cache))
            .build();

        let sequencer = Arc::new(Mutex::new(AuthorizationSequencer::new(
            config.authorization_expiry(),
        )));
        store.subscribe(Arc::new(SequencerFeed {
            sequencer: Arc::clone(&sequencer),
        }));

        Self {
            session,
            gateway,
            store,
            sequencer,
            cache,
        }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    #[must_use]
    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    #[must_use]
    pub fn conversations(&self) -> &ConversationStore {
        &self.store
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<WorkflowSessionCache> {
        &self.cache
    }

    /// Exclusive access to the authorization queue.
    pub fn authorizations(&self) -> MutexGuard<'_, AuthorizationSequencer> {
        lock_sequencer(&self.sequencer)
    }
}
