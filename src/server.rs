use std::sync::Arc;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::attachments::{AttachmentPipeline, AttachmentPolicy, FsBlobStore};
use crate::client::{ChatClient, ChatServices, ClientCommand, ClientEvent};
use crate::config::Config;
use crate::delivery::DeliveryHub;
use crate::directory::{lookup, SqliteDirectory};
use crate::error::ChatError;
use crate::message_log::MessageLog;
use crate::models::{FileDescriptor, UserProfile};
use crate::session::{ConnectionSession, Session};

/// Requests a connected client may send, one JSON object per text frame.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Register {
        username: String,
        #[serde(default)]
        display_name: String,
        #[serde(default)]
        email: String,
    },
    Login {
        username: String,
        token: String,
    },
    SendText {
        receiver_id: Uuid,
        body: String,
    },
    SendAttachment {
        receiver_id: Uuid,
        name: String,
        content_type: String,
        data_base64: String,
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
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionResponse {
    Prompt { message: String },
    /// `token` is only present right after registration; it is the
    /// credential for later logins.
    LoggedIn {
        user: UserProfile,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum ServerResponse {
    Session(SessionResponse),
    Event(ClientEvent),
}

pub struct Server {
    services: ChatServices,
    directory: Arc<SqliteDirectory>,
}

impl Server {
    pub fn new(config: &Config) -> Result<Self> {
        let log = MessageLog::open(
            &config.database_url,
            DeliveryHub::new(config.delivery_buffer),
        )?;
        let blobs = FsBlobStore::new(&config.attachment_dir, &config.attachment_base_url)?;
        let attachments = AttachmentPipeline::new(
            AttachmentPolicy::chat(config.attachment_max_bytes),
            Arc::new(blobs),
        );
        let directory = Arc::new(SqliteDirectory::new(&config.database_url)?);
        Ok(Server {
            services: ChatServices {
                log,
                attachments,
                directory: directory.clone(),
                poll_interval: config.unread_poll_interval,
            },
            directory,
        })
    }

    pub async fn run(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server running on {}", addr);

        loop {
            let (socket, peer) = listener.accept().await?;
            info!("New connection: {}", peer);

            let services = self.services.clone();
            let directory = Arc::clone(&self.directory);
            tokio::spawn(async move {
                if let Err(e) = handle_client(socket, services, directory).await {
                    error!("Error handling client {}: {}", peer, e);
                }
                info!("Connection closed: {}", peer);
            });
        }
    }
}

async fn handle_client(
    socket: TcpStream,
    services: ChatServices,
    directory: Arc<SqliteDirectory>,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(socket).await?;
    let (mut ws_write, mut ws_read) = ws.split();
    let (tx, mut rx) = mpsc::channel::<ServerResponse>(100);

    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let response_json = serde_json::to_string(&response)?;
            debug!("Sending to client: {}", response_json);
            ws_write.send(WsMessage::Text(response_json)).await?;
        }
        // the peer may already be gone
        let _ = ws_write.close().await;
        Ok::<(), anyhow::Error>(())
    });

    let session = Arc::new(ConnectionSession::new());
    let (command_tx, command_rx) = mpsc::channel::<ClientCommand>(32);
    let (event_tx, mut event_rx) = mpsc::channel::<ClientEvent>(100);
    let actor = tokio::spawn(ChatClient::new(session.clone(), services).run(command_rx, event_tx));

    let events_out = tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if events_out.send(ServerResponse::Event(event)).await.is_err() {
                break;
            }
        }
    });

    tx.send(ServerResponse::Session(SessionResponse::Prompt {
        message: "Send 'register' or 'login' to start".to_string(),
    }))
    .await?;

    while let Some(frame) = ws_read.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                debug!("Received from user {:?}: {}", session.current_user_id(), text);
                handle_request(&text, &session, &directory, &command_tx, &tx).await?;
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Error reading from socket: {}", e);
                break;
            }
        }
    }

    // closing the command channel stops the actor, which unsubscribes
    drop(command_tx);
    actor.await?;
    forwarder.await?;
    drop(tx);
    writer.await??;
    Ok(())
}

async fn handle_request(
    text: &str,
    session: &ConnectionSession,
    directory: &Arc<SqliteDirectory>,
    commands: &mpsc::Sender<ClientCommand>,
    tx: &mpsc::Sender<ServerResponse>,
) -> Result<()> {
    let request = match serde_json::from_str::<ClientRequest>(text) {
        Ok(request) => request,
        Err(e) => {
            tx.send(ServerResponse::Event(ClientEvent::Error {
                code: "INVALID_REQUEST".to_string(),
                message: format!("Invalid message format: {}", e),
            }))
            .await?;
            return Ok(());
        }
    };

    let command = match request {
        ClientRequest::Register {
            username,
            display_name,
            email,
        } => {
            let registered = lookup(directory, move |d| {
                let user = d.register(&username, &display_name, &email)?;
                let token = d.issue_token(&user.id)?;
                Ok((user, Some(token)))
            })
            .await;
            return sign_in(registered, session, commands, tx).await;
        }
        ClientRequest::Login { username, token } => {
            let found = lookup(directory, move |d| {
                d.authenticate(&username, &token).map(|user| (user, None))
            })
            .await;
            return sign_in(found, session, commands, tx).await;
        }
        ClientRequest::SendAttachment {
            receiver_id,
            name,
            content_type,
            data_base64,
        } => match STANDARD.decode(data_base64.as_bytes()) {
            Ok(data) => ClientCommand::SendAttachment {
                receiver_id,
                file: FileDescriptor {
                    name,
                    content_type,
                    size_bytes: data.len() as u64,
                },
                data,
            },
            Err(e) => {
                let err = ChatError::Validation(format!("attachment is not valid base64: {}", e));
                tx.send(ServerResponse::Event(ClientEvent::from(&err))).await?;
                return Ok(());
            }
        },
        ClientRequest::SendText { receiver_id, body } => ClientCommand::SendText { receiver_id, body },
        ClientRequest::OpenConversation { counterparty_id } => {
            ClientCommand::OpenConversation { counterparty_id }
        }
        ClientRequest::CloseConversation => ClientCommand::CloseConversation,
        ClientRequest::SetForeground { foregrounded } => ClientCommand::SetForeground { foregrounded },
        ClientRequest::UnreadSummary => ClientCommand::UnreadSummary,
        ClientRequest::Contacts => ClientCommand::Contacts,
        ClientRequest::Conversations => ClientCommand::Conversations,
    };
    commands.send(command).await?;
    Ok(())
}

async fn sign_in(
    user: Result<(UserProfile, Option<String>), ChatError>,
    session: &ConnectionSession,
    commands: &mpsc::Sender<ClientCommand>,
    tx: &mpsc::Sender<ServerResponse>,
) -> Result<()> {
    match user {
        Ok((user, token)) => {
            info!("{} signed in as {}", user.id, user.username);
            session.sign_in(user.id);
            commands.send(ClientCommand::CloseConversation).await?;
            commands.send(ClientCommand::Subscribe).await?;
            tx.send(ServerResponse::Session(SessionResponse::LoggedIn { user, token }))
                .await?;
        }
        Err(e) => {
            tx.send(ServerResponse::Event(ClientEvent::from(&e))).await?;
        }
    }
    Ok(())
}
