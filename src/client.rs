use std::future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::aggregator::UnreadAggregator;
use crate::attachments::AttachmentPipeline;
use crate::delivery::{ConnectionState, InsertEvent, Subscription};
use crate::directory::{lookup, UserDirectory};
use crate::dispatcher::{Alert, Dispatch, NotificationDispatcher, ViewContext};
use crate::error::{ChatError, ChatResult};
use crate::message_log::MessageLog;
use crate::models::{
    ConversationSummary, FileDescriptor, Message, MessageKind, UnreadIndex, UserProfile,
};
use crate::reader::{ConversationReader, LoadedTranscript, RenderedMessage};
use crate::session::{require_user, Session};

/// Server-side collaborators shared by every connected client.
#[derive(Clone)]
pub struct ChatServices {
    pub log: MessageLog,
    pub attachments: AttachmentPipeline,
    pub directory: Arc<dyn UserDirectory>,
    pub poll_interval: Duration,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    SendText {
        receiver_id: Uuid,
        body: String,
    },
    SendAttachment {
        receiver_id: Uuid,
        file: FileDescriptor,
        data: Vec<u8>,
    },
    OpenConversation {
        counterparty_id: Uuid,
    },
    CloseConversation,
    SetForeground {
        foregrounded: bool,
    },
    UnreadSummary,
    Contacts,
    Conversations,
    Subscribe,
    Unsubscribe,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Sent { message: Message },
    Transcript {
        counterparty_id: Uuid,
        messages: Vec<RenderedMessage>,
    },
    TranscriptAppended { message: RenderedMessage },
    ConversationClosed,
    Alert { alert: Alert },
    Unread { unread: UnreadIndex },
    Contacts { users: Vec<UserProfile> },
    Conversations { conversations: Vec<ConversationSummary> },
    Subscribed,
    Unsubscribed,
    Reconnecting,
    Error { code: String, message: String },
}

impl From<&ChatError> for ClientEvent {
    fn from(err: &ChatError) -> Self {
        ClientEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// A conversation just opened, with the unread index as it stands after
/// the open marked it read.
#[derive(Clone, Debug, PartialEq)]
pub struct OpenedConversation {
    pub messages: Vec<RenderedMessage>,
    pub unread: UnreadIndex,
}

/// Result of handling one pushed insert.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PushOutcome {
    pub appended: Option<RenderedMessage>,
    pub dispatch: Option<Dispatch>,
}

/// One connected client: a single actor owning its open conversation,
/// its push subscription and its view state.
pub struct ChatClient {
    session: Arc<dyn Session>,
    services: ChatServices,
    aggregator: UnreadAggregator,
    dispatcher: NotificationDispatcher,
    reader: ConversationReader,
    foregrounded: bool,
    wants_push: bool,
    subscription: Option<Subscription>,
    pending_open: Option<JoinHandle<ChatResult<LoadedTranscript>>>,
}

impl ChatClient {
    pub fn new(session: Arc<dyn Session>, services: ChatServices) -> Self {
        let aggregator = UnreadAggregator::new(services.log.clone());
        let dispatcher = NotificationDispatcher::new(
            aggregator.clone(),
            Arc::clone(&services.directory),
            services.poll_interval,
        );
        ChatClient {
            session,
            reader: ConversationReader::new(services.log.clone()),
            services,
            aggregator,
            dispatcher,
            foregrounded: true,
            wants_push: false,
            subscription: None,
            pending_open: None,
        }
    }

    pub fn view(&self) -> ViewContext {
        ViewContext {
            open_counterparty: self.reader.counterparty(),
            foregrounded: self.foregrounded,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.subscription
            .as_ref()
            .map(Subscription::state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn transcript(&self) -> &[RenderedMessage] {
        self.reader.transcript()
    }

    pub async fn send_text(&mut self, receiver_id: Uuid, body: &str) -> ChatResult<Message> {
        let user = require_user(self.session.as_ref())?;
        let message = self
            .services
            .log
            .append(user, receiver_id, MessageKind::Text, body, None)
            .await?;
        self.show_own(user, &message).await?;
        Ok(message)
    }

    /// Uploads the file and appends a message pointing at it. Nothing is
    /// appended if validation or the upload fails.
    pub async fn send_attachment(
        &mut self,
        receiver_id: Uuid,
        file: &FileDescriptor,
        data: Vec<u8>,
    ) -> ChatResult<Message> {
        let user = require_user(self.session.as_ref())?;
        let stored = self.services.attachments.upload(file, data).await?;
        let body = stored.attachment.name.clone();
        let message = self
            .services
            .log
            .append(user, receiver_id, stored.kind, &body, Some(stored.attachment))
            .await?;
        self.show_own(user, &message).await?;
        Ok(message)
    }

    pub async fn open_conversation(&mut self, counterparty_id: Uuid) -> ChatResult<OpenedConversation> {
        let user = require_user(self.session.as_ref())?;
        self.cancel_pending_open();
        let messages = self.reader.open(user, counterparty_id).await?.to_vec();
        let unread = self.aggregator.refresh(user).await?;
        Ok(OpenedConversation { messages, unread })
    }

    pub fn close_conversation(&mut self) {
        self.cancel_pending_open();
        self.reader.close();
    }

    pub fn set_foreground(&mut self, foregrounded: bool) {
        self.foregrounded = foregrounded;
    }

    pub async fn unread_summary(&self) -> ChatResult<UnreadIndex> {
        let user = require_user(self.session.as_ref())?;
        self.aggregator.refresh(user).await
    }

    pub async fn contacts(&self) -> ChatResult<Vec<UserProfile>> {
        let user = require_user(self.session.as_ref())?;
        lookup(&self.services.directory, move |d| d.list_contacts(&user)).await
    }

    pub async fn conversations(&self) -> ChatResult<Vec<ConversationSummary>> {
        let user = require_user(self.session.as_ref())?;
        self.services.log.conversations(user).await
    }

    /// Subscribes to the push feed for the signed-in user, replacing any
    /// previous subscription.
    pub async fn subscribe(&mut self) -> ChatResult<()> {
        let user = require_user(self.session.as_ref())?;
        self.drop_subscription().await;
        self.subscription = Some(self.services.log.hub().subscribe(user).await);
        self.wants_push = true;
        info!("Client for {} subscribed", user);
        Ok(())
    }

    /// Leaves the push feed; the poll no longer resubscribes.
    pub async fn unsubscribe(&mut self) {
        self.wants_push = false;
        self.drop_subscription().await;
    }

    async fn drop_subscription(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe().await;
        }
    }

    /// Waits for the next pushed insert and handles it.
    pub async fn process_next_push(&mut self) -> ChatResult<PushOutcome> {
        let event = match self.subscription.as_mut() {
            Some(subscription) => subscription.recv().await,
            None => Err(ChatError::DeliveryChannel("not subscribed".into())),
        };
        match event {
            Ok(event) => self.handle_push(event).await,
            Err(e) => {
                self.subscription = None;
                Err(e)
            }
        }
    }

    pub async fn handle_push(&mut self, event: InsertEvent) -> ChatResult<PushOutcome> {
        let user = require_user(self.session.as_ref())?;
        let appended = self
            .reader
            .receive(user, event.message.clone(), self.foregrounded)
            .await?;
        let dispatch = self.dispatcher.on_insert(&event, user, &self.view()).await?;
        Ok(PushOutcome { appended, dispatch })
    }

    /// Drives the client until the command channel closes: commands, pushed
    /// inserts, finished transcript loads and the unread poll are handled
    /// one at a time.
    pub async fn run(mut self, mut commands: mpsc::Receiver<ClientCommand>, events: mpsc::Sender<ClientEvent>) {
        let mut poll = tokio::time::interval(self.dispatcher.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, &events).await,
                    None => break,
                },
                pushed = next_push(&mut self.subscription) => {
                    self.on_pushed(pushed, &events).await;
                }
                loaded = next_load(&mut self.pending_open) => {
                    self.pending_open = None;
                    self.on_loaded(loaded, &events).await;
                }
                _ = poll.tick() => self.on_poll(&events).await,
            }
        }

        self.cancel_pending_open();
        self.unsubscribe().await;
        debug!("Client actor stopped");
    }

    async fn handle_command(&mut self, command: ClientCommand, events: &mpsc::Sender<ClientEvent>) {
        let result = match command {
            ClientCommand::SendText { receiver_id, body } => self
                .send_text(receiver_id, &body)
                .await
                .map(|message| vec![ClientEvent::Sent { message }]),
            ClientCommand::SendAttachment {
                receiver_id,
                file,
                data,
            } => self
                .send_attachment(receiver_id, &file, data)
                .await
                .map(|message| vec![ClientEvent::Sent { message }]),
            ClientCommand::OpenConversation { counterparty_id } => {
                self.start_open(counterparty_id).map(|_| Vec::new())
            }
            ClientCommand::CloseConversation => {
                self.close_conversation();
                Ok(vec![ClientEvent::ConversationClosed])
            }
            ClientCommand::SetForeground { foregrounded } => {
                self.set_foreground(foregrounded);
                Ok(Vec::new())
            }
            ClientCommand::UnreadSummary => self
                .unread_summary()
                .await
                .map(|unread| vec![ClientEvent::Unread { unread }]),
            ClientCommand::Contacts => self
                .contacts()
                .await
                .map(|users| vec![ClientEvent::Contacts { users }]),
            ClientCommand::Conversations => self
                .conversations()
                .await
                .map(|conversations| vec![ClientEvent::Conversations { conversations }]),
            ClientCommand::Subscribe => self.subscribe().await.map(|_| vec![ClientEvent::Subscribed]),
            ClientCommand::Unsubscribe => {
                self.unsubscribe().await;
                Ok(vec![ClientEvent::Unsubscribed])
            }
        };

        match result {
            Ok(out) => {
                for event in out {
                    emit(events, event).await;
                }
            }
            Err(e) => {
                warn!("Command failed: {}", e);
                emit(events, ClientEvent::from(&e)).await;
            }
        }
    }

    /// Starts loading a conversation off the actor, cancelling any load
    /// still running for the previous one.
    fn start_open(&mut self, counterparty_id: Uuid) -> ChatResult<()> {
        let user = require_user(self.session.as_ref())?;
        self.cancel_pending_open();
        let ticket = self.reader.begin_open(user, counterparty_id);
        let log = self.services.log.clone();
        self.pending_open = Some(tokio::spawn(ConversationReader::load(log, ticket)));
        Ok(())
    }

    fn cancel_pending_open(&mut self) {
        if let Some(handle) = self.pending_open.take() {
            handle.abort();
        }
    }

    async fn on_loaded(
        &mut self,
        loaded: Result<ChatResult<LoadedTranscript>, JoinError>,
        events: &mpsc::Sender<ClientEvent>,
    ) {
        let loaded = match loaded {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(e)) => {
                warn!("Loading conversation failed: {}", e);
                emit(events, ClientEvent::from(&e)).await;
                return;
            }
            Err(e) => {
                debug!("Conversation load did not finish: {}", e);
                return;
            }
        };
        if !self.reader.finish_open(loaded) {
            return;
        }
        if let Some(counterparty_id) = self.reader.counterparty() {
            emit(
                events,
                ClientEvent::Transcript {
                    counterparty_id,
                    messages: self.reader.transcript().to_vec(),
                },
            )
            .await;
        }
        self.on_poll(events).await;
    }

    async fn on_pushed(&mut self, pushed: ChatResult<InsertEvent>, events: &mpsc::Sender<ClientEvent>) {
        let event = match pushed {
            Ok(event) => event,
            Err(e) => {
                // the poll keeps counts right until we resubscribe
                warn!("Push feed lost: {}", e);
                self.subscription = None;
                emit(events, ClientEvent::Reconnecting).await;
                return;
            }
        };
        match self.handle_push(event).await {
            Ok(outcome) => {
                if let Some(message) = outcome.appended {
                    emit(events, ClientEvent::TranscriptAppended { message }).await;
                }
                if let Some(dispatch) = outcome.dispatch {
                    if let Some(alert) = dispatch.alert {
                        emit(events, ClientEvent::Alert { alert }).await;
                    }
                    emit(events, ClientEvent::Unread { unread: dispatch.unread }).await;
                }
            }
            Err(e) => {
                warn!("Handling pushed message failed: {}", e);
                emit(events, ClientEvent::from(&e)).await;
            }
        }
    }

    async fn on_poll(&mut self, events: &mpsc::Sender<ClientEvent>) {
        let Some(user) = self.session.current_user_id() else {
            return;
        };
        if self.wants_push && self.subscription.is_none() && self.subscribe().await.is_ok() {
            emit(events, ClientEvent::Subscribed).await;
        }
        match self.dispatcher.poll(user).await {
            Ok(unread) => emit(events, ClientEvent::Unread { unread }).await,
            Err(e) => warn!("Unread poll failed for {}: {}", user, e),
        }
    }

    /// Shows the sender's own message in the open conversation.
    async fn show_own(&mut self, user: Uuid, message: &Message) -> ChatResult<()> {
        self.reader
            .receive(user, message.clone(), self.foregrounded)
            .await?;
        Ok(())
    }
}

async fn next_push(subscription: &mut Option<Subscription>) -> ChatResult<InsertEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => future::pending().await,
    }
}

async fn next_load(
    pending: &mut Option<JoinHandle<ChatResult<LoadedTranscript>>>,
) -> Result<ChatResult<LoadedTranscript>, JoinError> {
    match pending {
        Some(handle) => handle.await,
        None => future::pending().await,
    }
}

async fn emit(events: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    if events.send(event).await.is_err() {
        debug!("Client event receiver dropped");
    }
}
