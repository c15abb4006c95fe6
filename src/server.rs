use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::context::{prime_with_greeting, HistoryWindows};
use crate::database::{
    CharacterDatabase, CharacterDraft, CharacterRecord, Conversation, ConversationListEntry,
    ProfileDraft, StoredMessage, UserProfile,
};
use crate::feed::{MessageFeed, MessageSnapshot};
use crate::id::{IdGenerator, UuidGenerator};
use crate::llm::GeminiClient;
use crate::turn::{TurnError, TurnOrchestrator};

#[derive(Clone)]
pub struct ServerState {
    pub db: Arc<CharacterDatabase>,
    pub feed: Arc<MessageFeed>,
    pub orchestrator: Arc<TurnOrchestrator>,
    pub ids: Arc<dyn IdGenerator>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ListConversationsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct MintedConversation {
    conversation_id: String,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: String,
}

#[derive(Debug, Serialize)]
struct SendMessageResponse {
    content: String,
}

#[derive(Debug, Deserialize)]
struct RenameConversationRequest {
    title: String,
}

#[derive(Debug, Serialize)]
struct SummarizeResponse {
    summary: String,
}

#[derive(Debug, Deserialize)]
struct SaveSummaryRequest {
    summary: String,
}

pub async fn run_server(config: AppConfig) -> Result<()> {
    let bind_addr = config
        .bind_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid bind address '{}'", config.bind_addr))?;

    let db = Arc::new(CharacterDatabase::new(&config.database_path)?);
    let feed = Arc::new(MessageFeed::new());
    if config.gemini_api_key.is_none() {
        tracing::warn!(
            "GEMINI_API_KEY is not configured; chat and summarize calls will fail until it is set"
        );
    }
    let generation = Arc::new(GeminiClient::new(
        config.gemini_api_url.clone(),
        config.gemini_api_key.clone(),
        config.chat_model.clone(),
        config.summary_model.clone(),
    ));
    let orchestrator = Arc::new(TurnOrchestrator::new(
        db.clone(),
        feed.clone(),
        generation,
        HistoryWindows {
            standard: config.history_window,
            summarized: config.summarized_history_window,
        },
        config.min_messages_for_summary,
        config.summary_char_budget,
    ));

    let state = Arc::new(ServerState {
        db,
        feed,
        orchestrator,
        ids: Arc::new(UuidGenerator),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind server to {}", bind_addr))?;
    tracing::info!("stagedoor listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/characters", get(list_characters).post(create_character))
        .route(
            "/characters/:character_id",
            get(get_character).put(update_character),
        )
        .route("/profile", get(get_profile).put(save_profile))
        .route(
            "/profile/library",
            get(list_profile_library).post(save_profile_variant),
        )
        .route(
            "/characters/:character_id/conversations",
            get(list_conversations).post(mint_conversation),
        )
        .route(
            "/conversations/:conversation_id",
            get(get_conversation).put(rename_conversation),
        )
        .route(
            "/characters/:character_id/conversations/:conversation_id/messages",
            get(list_messages).post(send_message),
        )
        .route(
            "/characters/:character_id/conversations/:conversation_id/messages/ws",
            get(ws_messages_route),
        )
        .route(
            "/characters/:character_id/conversations/:conversation_id/summarize",
            post(summarize_conversation),
        )
        .route(
            "/characters/:character_id/conversations/:conversation_id/summary",
            put(save_summary),
        )
        .with_state(state);

    Router::new().nest("/v1", api)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ----------------------------------------------------------------------
// Characters and profiles (plain CRUD over the document store)
// ----------------------------------------------------------------------

async fn list_characters(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<CharacterRecord>>, ApiError> {
    state.db.list_characters().map(Json).map_err(internal_error)
}

async fn create_character(
    State(state): State<Arc<ServerState>>,
    Json(draft): Json<CharacterDraft>,
) -> Result<Json<CharacterRecord>, ApiError> {
    state
        .db
        .create_character(&draft)
        .map(Json)
        .map_err(bad_request)
}

async fn get_character(
    State(state): State<Arc<ServerState>>,
    Path(character_id): Path<String>,
) -> Result<Json<CharacterRecord>, ApiError> {
    require_character(&state, &character_id).map(Json)
}

async fn update_character(
    State(state): State<Arc<ServerState>>,
    Path(character_id): Path<String>,
    Json(draft): Json<CharacterDraft>,
) -> Result<Json<CharacterRecord>, ApiError> {
    match state
        .db
        .update_character(&character_id, &draft)
        .map_err(bad_request)?
    {
        Some(character) => Ok(Json(character)),
        None => Err(not_found(format!("character '{}' not found", character_id))),
    }
}

async fn get_profile(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<UserProfile>, ApiError> {
    state
        .db
        .get_active_profile()
        .map(Json)
        .map_err(internal_error)
}

async fn save_profile(
    State(state): State<Arc<ServerState>>,
    Json(draft): Json<ProfileDraft>,
) -> Result<Json<UserProfile>, ApiError> {
    state
        .db
        .save_active_profile(&draft)
        .map(Json)
        .map_err(bad_request)
}

async fn list_profile_library(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<UserProfile>>, ApiError> {
    state
        .db
        .list_profile_variants()
        .map(Json)
        .map_err(internal_error)
}

async fn save_profile_variant(
    State(state): State<Arc<ServerState>>,
    Json(draft): Json<ProfileDraft>,
) -> Result<Json<UserProfile>, ApiError> {
    state
        .db
        .save_profile_variant(&draft)
        .map(Json)
        .map_err(bad_request)
}

// ----------------------------------------------------------------------
// Conversations
// ----------------------------------------------------------------------

/// Mint a fresh conversation key. Deliberately writes nothing: the metadata
/// record is created lazily on first send.
async fn mint_conversation(
    State(state): State<Arc<ServerState>>,
    Path(character_id): Path<String>,
) -> Result<Json<MintedConversation>, ApiError> {
    require_character(&state, &character_id)?;
    Ok(Json(MintedConversation {
        conversation_id: state.ids.mint(),
    }))
}

async fn list_conversations(
    State(state): State<Arc<ServerState>>,
    Path(character_id): Path<String>,
    Query(query): Query<ListConversationsQuery>,
) -> Result<Json<Vec<ConversationListEntry>>, ApiError> {
    require_character(&state, &character_id)?;
    let limit = clamp_limit(query.limit, 100, 1, 1000);
    state
        .db
        .list_conversations_for_character(&character_id, limit)
        .map(Json)
        .map_err(internal_error)
}

/// `null` body means the metadata record has not been lazily created yet;
/// clients treat that as an empty new conversation, not as an error.
async fn get_conversation(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Option<Conversation>>, ApiError> {
    state
        .db
        .get_conversation(&conversation_id)
        .map(Json)
        .map_err(internal_error)
}

async fn rename_conversation(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<RenameConversationRequest>,
) -> Result<Json<Conversation>, ApiError> {
    let renamed = state
        .db
        .rename_conversation(&conversation_id, &body.title)
        .map_err(bad_request)?;
    if !renamed {
        return Err(not_found(format!(
            "conversation '{}' not found",
            conversation_id
        )));
    }
    state
        .db
        .get_conversation(&conversation_id)
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("conversation '{}' not found", conversation_id)))
}

// ----------------------------------------------------------------------
// Messages and turns
// ----------------------------------------------------------------------

async fn list_messages(
    State(state): State<Arc<ServerState>>,
    Path((character_id, conversation_id)): Path<(String, String)>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
    let character = require_character(&state, &character_id)?;
    let messages = state
        .db
        .list_messages(&conversation_id)
        .map_err(internal_error)?;
    Ok(Json(prime_with_greeting(
        &character,
        &conversation_id,
        messages,
    )))
}

async fn send_message(
    State(state): State<Arc<ServerState>>,
    Path((character_id, conversation_id)): Path<(String, String)>,
    Json(body): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let receipt = state
        .orchestrator
        .run_turn(&character_id, &conversation_id, &body.content)
        .await
        .map_err(turn_error)?;
    Ok(Json(SendMessageResponse {
        content: receipt.model_message.content,
    }))
}

async fn summarize_conversation(
    State(state): State<Arc<ServerState>>,
    Path((character_id, conversation_id)): Path<(String, String)>,
) -> Result<Json<SummarizeResponse>, ApiError> {
    let summary = state
        .orchestrator
        .stage_summary(&character_id, &conversation_id)
        .await
        .map_err(turn_error)?;
    Ok(Json(SummarizeResponse { summary }))
}

/// Commit a reviewed summary. Merge-style: only `current_summary` changes;
/// an empty body clears it.
async fn save_summary(
    State(state): State<Arc<ServerState>>,
    Path((character_id, conversation_id)): Path<(String, String)>,
    Json(body): Json<SaveSummaryRequest>,
) -> Result<Json<Conversation>, ApiError> {
    require_character(&state, &character_id)?;
    state
        .db
        .set_conversation_summary(&conversation_id, &character_id, &body.summary)
        .map_err(internal_error)?;
    state
        .db
        .get_conversation(&conversation_id)
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("conversation '{}' not found", conversation_id)))
}

// ----------------------------------------------------------------------
// Live message feed
// ----------------------------------------------------------------------

async fn ws_messages_route(
    State(state): State<Arc<ServerState>>,
    Path((character_id, conversation_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let character = require_character(&state, &character_id)?;
    Ok(ws.on_upgrade(move |socket| {
        handle_messages_socket(state, character, conversation_id, socket)
    }))
}

async fn handle_messages_socket(
    state: Arc<ServerState>,
    character: CharacterRecord,
    conversation_id: String,
    mut socket: WebSocket,
) {
    let mut rx = state.feed.subscribe(&conversation_id);

    // Initial snapshot so a fresh view renders without waiting for a send.
    // Subscribing first means nothing published after the read is missed;
    // anything buffered before it is dropped by the staleness check below.
    let mut sent_len = match state.db.list_messages(&conversation_id) {
        Ok(messages) => {
            let len = messages.len();
            let primed = prime_with_greeting(&character, &conversation_id, messages);
            if send_snapshot(&mut socket, &primed).await.is_err() {
                return;
            }
            len
        }
        Err(e) => {
            tracing::warn!(conversation_id, "failed to load initial snapshot: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(snapshot) => {
                        let Some(snapshot) = advance_snapshot(snapshot, &mut sent_len) else {
                            continue;
                        };
                        let primed =
                            prime_with_greeting(&character, &conversation_id, snapshot.to_vec());
                        if send_snapshot(&mut socket, &primed).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Snapshots are whole, so skipping to the latest is safe.
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

/// The log is append-only, so snapshot length orders snapshots. One that is
/// no longer than what was already sent (buffered before the initial read,
/// or a duplicate) is dropped instead of regressing the client's view.
fn advance_snapshot(snapshot: MessageSnapshot, sent_len: &mut usize) -> Option<MessageSnapshot> {
    if snapshot.len() <= *sent_len {
        return None;
    }
    *sent_len = snapshot.len();
    Some(snapshot)
}

async fn send_snapshot(socket: &mut WebSocket, messages: &[StoredMessage]) -> Result<()> {
    let payload = serde_json::to_string(messages).context("Failed to serialize snapshot")?;
    socket
        .send(Message::Text(payload))
        .await
        .context("Websocket send failed")
}

// ----------------------------------------------------------------------
// Error mapping
// ----------------------------------------------------------------------

fn require_character(
    state: &ServerState,
    character_id: &str,
) -> Result<CharacterRecord, ApiError> {
    state
        .db
        .get_character(character_id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found(format!("character '{}' not found", character_id)))
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn turn_error(error: TurnError) -> ApiError {
    let status = match &error {
        TurnError::EmptyInput | TurnError::NotEnoughMessages { .. } => StatusCode::BAD_REQUEST,
        TurnError::AlreadyInFlight => StatusCode::CONFLICT,
        TurnError::MissingCharacter(_) => StatusCode::NOT_FOUND,
        TurnError::Storage(_) | TurnError::Generation(_) | TurnError::NoReplyProduced => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
}

fn not_found(message: String) -> ApiError {
    (StatusCode::NOT_FOUND, Json(ErrorBody { error: message }))
}

fn bad_request(error: anyhow::Error) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
}

fn internal_error(error: anyhow::Error) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
}
