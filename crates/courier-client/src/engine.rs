//! Direct-message engine.
//!
//! Sends, fetches and live-receives encrypted direct messages for the
//! logged-in identity. The cache is consulted first; the network is only
//! queried on a miss. Every message that passes through the engine is
//! persisted and merged into the in-memory [`ConversationIndex`].

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use courier_net::{Subscription, SubscriptionCloser, SubscriptionEvent, SubscriptionRouter};
use courier_shared::constants::KIND_DIRECT_MESSAGE;
use courier_shared::event::unix_now;
use courier_shared::message::seal_direct_message;
use courier_shared::protocol::addressed_party;
use courier_shared::{ChatId, DirectMessage, Filter, PublicKey, SignedEvent, Signer};
use courier_store::{CachedEvent, MessageCache};

use crate::error::{EngineError, FetchError, SendError};
use crate::index::ConversationIndex;

pub type MessageCallback = Box<dyn Fn(DirectMessage) + Send + Sync>;

#[derive(Clone)]
struct ActiveIdentity {
    signer: Arc<dyn Signer>,
    generation: u64,
}

/// State shared with live-subscription tasks.
struct EngineShared {
    cache: Arc<dyn MessageCache>,
    index: Mutex<ConversationIndex>,
    generation: AtomicU64,
}

impl EngineShared {
    fn index(&self) -> MutexGuard<'_, ConversationIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Write-through of one message. Cache failures are logged only.
    fn persist(&self, event: &SignedEvent, message: &DirectMessage, me: &PublicKey) {
        let plaintext = message.decrypted.then_some(message.plaintext.as_str());
        if let Err(e) = self.cache.put_event(event, &message.chat_id(), plaintext) {
            warn!(event_id = %event.id, error = %e, "Failed to cache event");
        }
        self.note_counterparty(me, message.counterparty(me));
    }

    /// Extend the cached conversation set once a relay scan has filled it.
    /// Before that it stays empty so listing still goes to the relays.
    fn note_counterparty(&self, me: &PublicKey, counterparty: PublicKey) {
        let known = match self.cache.conversations(me) {
            Ok(known) => known,
            Err(e) => {
                warn!(error = %e, "Failed to read cached conversations");
                return;
            }
        };
        if known.is_empty() || known.contains(&counterparty) {
            return;
        }
        if let Err(e) = self
            .cache
            .put_conversations(me, &BTreeSet::from([counterparty]))
        {
            warn!(error = %e, "Failed to cache conversation");
        }
    }
}

pub struct DirectMessageEngine {
    router: Arc<SubscriptionRouter>,
    shared: Arc<EngineShared>,
    identity: RwLock<Option<ActiveIdentity>>,
    live: Mutex<Vec<Arc<LiveInner>>>,
    fetch_timeout: Duration,
}

impl DirectMessageEngine {
    pub fn new(
        router: Arc<SubscriptionRouter>,
        cache: Arc<dyn MessageCache>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            router,
            shared: Arc::new(EngineShared {
                cache,
                index: Mutex::new(ConversationIndex::new()),
                generation: AtomicU64::new(0),
            }),
            identity: RwLock::new(None),
            live: Mutex::new(Vec::new()),
            fetch_timeout,
        }
    }

    fn active(&self) -> Option<ActiveIdentity> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        self.active().map(|active| active.signer.public_key())
    }

    /// Make `signer` the active identity, logging out any previous one.
    pub async fn login(&self, signer: Arc<dyn Signer>) {
        if self.active().is_some() {
            self.logout().await;
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(pubkey = %signer.public_key().short(), "Identity logged in");
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) =
            Some(ActiveIdentity { signer, generation });
    }

    /// Drop the active identity, stop its live subscriptions and clear the
    /// in-memory index. The durable cache is kept.
    pub async fn logout(&self) {
        let previous = self
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        let live: Vec<Arc<LiveInner>> = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in &live {
            handle.stop().await;
        }
        let dropped = {
            let mut index = self.shared.index();
            let dropped = index.len();
            index.clear();
            dropped
        };

        if let Some(previous) = previous {
            info!(
                pubkey = %previous.signer.public_key().short(),
                cancelled = live.len(),
                dropped,
                "Identity logged out"
            );
        }
    }

    /// Encrypt, sign and publish a message to `recipient`.
    ///
    /// Succeeds when at least one relay accepts the event; the message is
    /// then cached and indexed.
    ///
    /// Content is limited to
    /// [`MAX_PLAINTEXT_SIZE`](courier_shared::constants::MAX_PLAINTEXT_SIZE)
    /// bytes of UTF-8. Longer
    /// content cannot be encrypted and fails with [`SendError::Event`]
    /// before anything is published.
    pub async fn send(&self, recipient: &PublicKey, content: &str) -> Result<DirectMessage, SendError> {
        let active = self.active().ok_or(SendError::NoIdentity)?;
        if content.trim().is_empty() {
            return Err(SendError::EmptyContent);
        }

        let signer = active.signer.as_ref();
        let me = signer.public_key();
        let event = seal_direct_message(signer, recipient, content)?;

        let results = self.router.publish(&event, None).await;
        if results.is_empty() {
            return Err(SendError::NoRelay);
        }
        let accepted = results.iter().filter(|r| r.is_accepted()).count();
        if accepted == 0 {
            for result in &results {
                if let Err(e) = &result.outcome {
                    debug!(relay = %result.relay, error = %e, "Relay refused message");
                }
            }
            return Err(SendError::NotAccepted {
                attempted: results.len(),
            });
        }

        let message = DirectMessage::from_event(&event, *recipient, Ok(content.to_string()));
        self.shared.persist(&event, &message, &me);
        self.shared.index().insert(message.clone());

        info!(
            event_id = %event.id,
            recipient = %recipient.short(),
            accepted,
            relays = results.len(),
            "Message sent"
        );
        Ok(message)
    }

    /// The conversation with `counterparty`, ordered by `(created_at, id)`.
    ///
    /// Served from the cache when it holds anything for this chat; otherwise
    /// both directions are requested from the relays and collected until
    /// every relay signals end of stored events or the fetch timeout passes.
    pub async fn fetch(&self, counterparty: &PublicKey) -> Result<Vec<DirectMessage>, FetchError> {
        let active = self.active().ok_or(FetchError::NoIdentity)?;
        let signer = active.signer.as_ref();
        let me = signer.public_key();
        let chat = ChatId::new(&me, counterparty);

        let cached = match self.shared.cache.events_by_chat(&chat) {
            Ok(cached) => cached,
            Err(e) => {
                warn!(chat = %chat, error = %e, "Cache read failed, falling back to relays");
                Vec::new()
            }
        };

        if !cached.is_empty() {
            debug!(chat = %chat, events = cached.len(), "Serving conversation from cache");
            let messages: Vec<DirectMessage> = cached
                .iter()
                .filter_map(|cached| self.restore(cached, signer))
                .collect();
            self.shared.index().extend(messages);
            return Ok(self.shared.index().messages(&chat));
        }

        if self.router.manager().readable_sessions().await.is_empty() {
            return Err(FetchError::NoRelay);
        }

        let sent = Filter::new()
            .kind(KIND_DIRECT_MESSAGE)
            .author(&me)
            .pubkey(counterparty);
        let received = Filter::new()
            .kind(KIND_DIRECT_MESSAGE)
            .author(counterparty)
            .pubkey(&me);

        let deadline = Instant::now() + self.fetch_timeout;
        let (sent, received) = tokio::join!(
            self.collect_stored(vec![sent], deadline),
            self.collect_stored(vec![received], deadline),
        );

        let mut events = sent?;
        events.extend(received?);

        let mut messages = Vec::new();
        for event in events.into_values() {
            if let Some(message) = DirectMessage::open(&event, signer) {
                self.shared.persist(&event, &message, &me);
                messages.push(message);
            }
        }
        messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        if self.shared.is_current(active.generation) {
            self.shared.index().extend(messages.iter().cloned());
        }
        info!(chat = %chat, messages = messages.len(), "Conversation fetched from relays");
        Ok(messages)
    }

    /// Rebuild a message from a cached row, retrying decryption when the
    /// plaintext was never recovered.
    fn restore(&self, cached: &CachedEvent, signer: &dyn Signer) -> Option<DirectMessage> {
        let recipient = addressed_party(&cached.event)?;
        match &cached.plaintext {
            Some(plaintext) => Some(DirectMessage::from_event(
                &cached.event,
                recipient,
                Ok(plaintext.clone()),
            )),
            None => {
                let message = DirectMessage::open(&cached.event, signer)?;
                if message.decrypted {
                    self.shared
                        .persist(&cached.event, &message, &signer.public_key());
                }
                Some(message)
            }
        }
    }

    /// Open a subscription and gather events until end of stored events or
    /// `deadline`. Partial results are returned on timeout.
    async fn collect_stored(
        &self,
        filters: Vec<Filter>,
        deadline: Instant,
    ) -> Result<HashMap<String, SignedEvent>, FetchError> {
        let mut subscription = self.router.subscribe(filters).await?;
        let mut events = HashMap::new();

        loop {
            match tokio::time::timeout_at(deadline, subscription.next()).await {
                Ok(Some(SubscriptionEvent::Event { event, .. })) => {
                    events.insert(event.id.clone(), event);
                }
                Ok(Some(SubscriptionEvent::EndOfStoredEvents)) | Ok(None) => break,
                Err(_) => {
                    debug!(
                        subscription = %subscription.id(),
                        events = events.len(),
                        "Fetch timed out, keeping partial results"
                    );
                    break;
                }
            }
        }

        subscription.stop().await;
        Ok(events)
    }

    /// Counterparties of the active identity.
    ///
    /// Served from the cache once a scan has populated it; otherwise every
    /// direct message authored by or addressed to self is scanned. Later
    /// sends and receives merge into the scanned set.
    pub async fn list_conversations(&self) -> Result<BTreeSet<PublicKey>, FetchError> {
        let active = self.active().ok_or(FetchError::NoIdentity)?;
        let me = active.signer.public_key();

        match self.shared.cache.conversations(&me) {
            Ok(cached) if !cached.is_empty() => return Ok(cached),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Cache read failed, falling back to relays"),
        }

        if self.router.manager().readable_sessions().await.is_empty() {
            return Err(FetchError::NoRelay);
        }

        let authored = Filter::new().kind(KIND_DIRECT_MESSAGE).author(&me);
        let addressed = Filter::new().kind(KIND_DIRECT_MESSAGE).pubkey(&me);
        let events = self
            .collect_stored(vec![authored, addressed], Instant::now() + self.fetch_timeout)
            .await?;

        let mut counterparties: BTreeSet<PublicKey> = events
            .values()
            .filter_map(|event| {
                if event.pubkey == me {
                    addressed_party(event)
                } else {
                    Some(event.pubkey)
                }
            })
            .collect();
        // relays that timed out may not have returned what this session saw
        if self.shared.is_current(active.generation) {
            counterparties.extend(self.shared.index().counterparties(&me));
        }

        if !counterparties.is_empty() {
            if let Err(e) = self.shared.cache.put_conversations(&me, &counterparties) {
                warn!(error = %e, "Failed to cache conversations");
            }
        }
        info!(conversations = counterparties.len(), "Conversations scanned");
        Ok(counterparties)
    }

    /// Indexed messages with `counterparty`, without any I/O.
    pub fn messages(&self, counterparty: &PublicKey) -> Vec<DirectMessage> {
        match self.public_key() {
            Some(me) => self.shared.index().messages(&ChatId::new(&me, counterparty)),
            None => Vec::new(),
        }
    }

    /// Wipe the durable cache and the in-memory index.
    pub fn clear_cache(&self) -> Result<(), EngineError> {
        self.shared.cache.clear()?;
        self.shared.index().clear();
        info!("Message cache cleared");
        Ok(())
    }

    /// Receive messages addressed to the active identity as they arrive.
    ///
    /// Each new message from someone else is decrypted, cached, indexed and
    /// handed to `on_message`. Logout stops the subscription.
    pub async fn subscribe_live(
        &self,
        on_message: impl Fn(DirectMessage) + Send + Sync + 'static,
    ) -> Result<LiveSubscription, EngineError> {
        let active = self.active().ok_or(EngineError::NoIdentity)?;
        let me = active.signer.public_key();

        let filter = Filter::new()
            .kind(KIND_DIRECT_MESSAGE)
            .pubkey(&me)
            .since(unix_now());
        let subscription = self.router.subscribe(vec![filter]).await?;

        let inner = Arc::new(LiveInner {
            closer: subscription.closer(),
            callback: Mutex::new(Some(Box::new(on_message))),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(run_live(
            subscription,
            active,
            self.shared.clone(),
            inner.clone(),
        ));
        *inner.task() = Some(task);

        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        live.retain(|handle| !handle.closer.is_stopped());
        live.push(inner.clone());

        debug!(pubkey = %me.short(), "Live subscription started");
        Ok(LiveSubscription { inner })
    }
}

async fn run_live(
    mut subscription: Subscription,
    active: ActiveIdentity,
    shared: Arc<EngineShared>,
    handle: Arc<LiveInner>,
) {
    let signer = active.signer.as_ref();
    let me = signer.public_key();

    while let Some(event) = subscription.next().await {
        let SubscriptionEvent::Event { relay, event } = event else {
            continue;
        };
        if !shared.is_current(active.generation) {
            break;
        }
        if event.pubkey == me {
            continue;
        }
        let Some(message) = DirectMessage::open(&event, signer) else {
            continue;
        };

        shared.persist(&event, &message, &me);
        if !shared.index().insert(message.clone()) {
            continue;
        }

        debug!(relay = %relay, event_id = %event.id, decrypted = message.decrypted, "Live message");
        let delivered = match handle.callback().as_ref() {
            Some(on_message) => {
                on_message(message);
                true
            }
            None => false,
        };
        if !delivered {
            break;
        }
    }
}

struct LiveInner {
    closer: SubscriptionCloser,
    callback: Mutex<Option<MessageCallback>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveInner {
    fn callback(&self) -> MutexGuard<'_, Option<MessageCallback>> {
        self.callback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn stop(&self) {
        // waits for an in-flight callback to return
        self.callback().take();
        self.closer.stop().await;
        if let Some(task) = self.task().take() {
            task.abort();
        }
    }
}

/// Handle to a live message stream.
///
/// Once [`LiveSubscription::stop`] returns, the callback is never invoked
/// again. Dropping the handle does not stop the stream.
pub struct LiveSubscription {
    inner: Arc<LiveInner>,
}

impl LiveSubscription {
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.closer.is_stopped()
    }
}
