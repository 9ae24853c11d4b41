//! Chat history and completion requests.

use std::sync::Arc;

use async_trait::async_trait;
use hearth_local_ai::{ChatMessage, CompletionClient, ModelSelectionStore, Role};
use hearth_store::{
    load_json, save_json, KeyValueStore, Readiness, Resource, ResourceStore, StoreError,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ChatConfigStore;
use crate::error::SessionError;

/// Key the chat history is persisted under.
pub const CHAT_HISTORY_KEY: &str = "chat-history";

/// First message of every conversation.
pub const SYSTEM_PROMPT: &str = "You are a good assistant.";

/// The conversation with the local model.
///
/// Only this store writes the history. Every mutation is persisted
/// immediately. `ready` is held `false` for the duration of a completion
/// request, so requests run one at a time in arrival order.
pub struct ChatHistoryStore {
    store: ResourceStore<Vec<ChatMessage>>,
    storage: Arc<dyn KeyValueStore>,
    client: CompletionClient,
    config: Arc<ChatConfigStore>,
    selection: ModelSelectionStore,
}

impl ChatHistoryStore {
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        client: CompletionClient,
        config: Arc<ChatConfigStore>,
        selection: ModelSelectionStore,
    ) -> Self {
        Self {
            store: ResourceStore::new("history", vec![ChatMessage::system(SYSTEM_PROMPT)]),
            storage,
            client,
            config,
            selection,
        }
    }

    /// Snapshot of the conversation.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.store.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.store.subscribe()
    }

    /// Whether the last message is a user turn still waiting for a reply.
    pub fn awaiting_reply(&self) -> bool {
        self.store
            .borrow()
            .last()
            .is_some_and(|m| m.role == Role::User)
    }

    /// Answer the pending user turn and return the answer.
    ///
    /// When a concurrent request (such as the replay after a server
    /// restart) answers the turn first, its answer is returned instead of
    /// `None`. `None` means no turn was pending.
    pub async fn answer_pending(&self) -> Result<Option<ChatMessage>, SessionError> {
        let pending = {
            let history = self.store.borrow();
            match history.last() {
                Some(last) if last.role == Role::User => history.len() - 1,
                _ => return Ok(None),
            }
        };
        if let Some(reply) = self.request_completion(None).await? {
            return Ok(Some(reply));
        }
        Ok(self
            .store
            .borrow()
            .get(pending + 1)
            .filter(|m| m.role == Role::Assistant)
            .cloned())
    }

    /// Ask the model for the next assistant turn.
    ///
    /// With `Some(message)` the message is appended (and persisted) first,
    /// so it survives a failed request. With `None` the pending user turn
    /// is replayed; if there is none this returns `Ok(None)` without
    /// contacting the server. Waits for earlier requests to finish.
    pub async fn request_completion(
        &self,
        message: Option<String>,
    ) -> Result<Option<ChatMessage>, SessionError> {
        self.complete(message, None).await
    }

    /// Like [`request_completion`](Self::request_completion), forwarding
    /// reply fragments on `fragments` as they arrive.
    pub async fn stream_completion(
        &self,
        message: Option<String>,
        fragments: &mpsc::UnboundedSender<String>,
    ) -> Result<Option<ChatMessage>, SessionError> {
        self.complete(message, Some(fragments)).await
    }

    async fn complete(
        &self,
        message: Option<String>,
        fragments: Option<&mpsc::UnboundedSender<String>>,
    ) -> Result<Option<ChatMessage>, SessionError> {
        let _guard = self.store.ready().acquire().await;

        match message {
            Some(message) => self.push(ChatMessage::user(message)).await?,
            None if !self.awaiting_reply() => {
                debug!("No unanswered message to replay");
                return Ok(None);
            }
            None => info!("Replaying unanswered message"),
        }

        let parameters = self.selection.selected().map(|m| m.parameters);
        let request = self
            .config
            .config()
            .request(self.messages(), parameters.as_ref());

        let reply = match fragments {
            Some(fragments) => self.client.chat_completion_stream(&request, fragments).await,
            None => self.client.chat_completion(&request).await,
        }
        .map_err(|e| {
            warn!("Completion request failed: {}", e);
            e
        })?;

        let reply = ChatMessage::assistant(reply);
        self.push(reply.clone()).await?;
        Ok(Some(reply))
    }

    /// Truncate the conversation to the system prompt.
    ///
    /// Fails without touching the history while a request is in flight.
    pub async fn reset(&self) -> Result<(), SessionError> {
        let _guard = self
            .store
            .ready()
            .try_acquire()
            .ok_or(SessionError::NotReady("history"))?;

        warn!("Reset chat history");
        self.store.set(vec![ChatMessage::system(SYSTEM_PROMPT)]);
        self.persist().await
    }

    async fn push(&self, message: ChatMessage) -> Result<(), SessionError> {
        self.store.update(|history| history.push(message));
        self.persist().await
    }

    async fn persist(&self) -> Result<(), SessionError> {
        let history = self.messages();
        save_json(self.storage.as_ref(), CHAT_HISTORY_KEY, &history).await?;
        Ok(())
    }
}

#[async_trait]
impl Resource for ChatHistoryStore {
    type Error = SessionError;

    fn name(&self) -> &'static str {
        self.store.name()
    }

    fn readiness(&self) -> Readiness {
        self.store.ready().clone()
    }

    async fn init(&self) -> Result<(), SessionError> {
        self.store.activate();

        let stored = match load_json::<Vec<ChatMessage>>(self.storage.as_ref(), CHAT_HISTORY_KEY)
            .await
        {
            Ok(stored) => stored,
            Err(StoreError::Json(e)) => {
                warn!("Discarding unreadable chat history: {}", e);
                None
            }
            Err(e) => return Err(e.into()),
        };

        let mut history = stored.unwrap_or_default();
        if history.first().map(|m| m.role) != Some(Role::System) {
            history.insert(0, ChatMessage::system(SYSTEM_PROMPT));
        }
        debug!("Loaded {} chat messages", history.len());
        self.store.set(history);
        self.store.ready().set(true);
        Ok(())
    }

    async fn dispose(&self) {
        self.store.release();
    }
}
