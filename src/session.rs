//! Session context service: conversation threads, their document bridges,
//! and mode changes.

use chrono::Utc;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::message::Role;
use crate::models::{
    ConversationSession, Document, DocumentStatus, SessionMode, StoredMessage,
};
use crate::store::{self, StoreError};
use crate::tenant::TenantContext;

/// Title shown until the first user input names the conversation.
const DEFAULT_TITLE: &str = "New conversation";
/// Longest auto-derived title, in characters.
const TITLE_CHARS: usize = 60;

#[derive(Debug, Error, Diagnostic)]
pub enum SessionError {
    #[error("session not found")]
    #[diagnostic(code(ragloom::session::not_found))]
    NotFound,

    #[error("document not found")]
    #[diagnostic(code(ragloom::session::document_not_found))]
    DocumentNotFound,

    #[error("{0}")]
    #[diagnostic(code(ragloom::session::validation))]
    Validation(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSession {
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub mode: Option<SessionMode>,
}

/// Aggregate view returned by `GET /sessions/{id}/context`.
#[derive(Clone, Debug, Serialize)]
pub struct SessionContextView {
    pub mode: SessionMode,
    pub active_documents: Vec<Document>,
    pub total_documents: usize,
    pub total_chunks: i64,
}

pub struct SessionService {
    pool: SqlitePool,
}

impl SessionService {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, ctx, request), fields(tenant = %ctx.tenant_id))]
    pub async fn create(
        &self,
        ctx: &TenantContext,
        request: CreateSession,
    ) -> Result<ConversationSession> {
        let now = Utc::now();
        let session = ConversationSession {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            user_id: ctx.user_id,
            workflow_id: request.workflow_id,
            thread_id: format!("thread-{}", Uuid::new_v4().simple()),
            title: request
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            mode: request.mode.unwrap_or(SessionMode::Auto),
            metadata: json!({}),
            created_at: now,
            updated_at: now,
        };
        store::sessions::insert(&self.pool, &session).await?;
        Ok(session)
    }

    pub async fn get(&self, ctx: &TenantContext, id: Uuid) -> Result<ConversationSession> {
        store::sessions::get(&self.pool, ctx.tenant_id, id)
            .await?
            .ok_or(SessionError::NotFound)
    }

    pub async fn list(
        &self,
        ctx: &TenantContext,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ConversationSession>> {
        Ok(store::sessions::list(&self.pool, ctx.tenant_id, ctx.user_id, limit, offset).await?)
    }

    pub async fn update_mode(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        mode: SessionMode,
    ) -> Result<ConversationSession> {
        if !store::sessions::set_mode(&self.pool, ctx.tenant_id, id, mode).await? {
            return Err(SessionError::NotFound);
        }
        self.get(ctx, id).await
    }

    /// Bridge a document into the session. The document must belong to the
    /// session's tenant and be fully ingested.
    #[instrument(skip(self, ctx), fields(tenant = %ctx.tenant_id))]
    pub async fn add_document(
        &self,
        ctx: &TenantContext,
        session_id: Uuid,
        document_id: Uuid,
    ) -> Result<()> {
        let session = self.get(ctx, session_id).await?;
        let document = store::documents::get(&self.pool, ctx.tenant_id, document_id)
            .await?
            .ok_or(SessionError::DocumentNotFound)?;
        if document.status != DocumentStatus::Completed {
            return Err(SessionError::Validation(format!(
                "document is {}, expected completed",
                document.status
            )));
        }
        store::sessions::upsert_session_document(&self.pool, session.id, document.id).await?;
        store::sessions::touch(&self.pool, session.id).await?;
        Ok(())
    }

    /// Soft-remove the bridge; the document itself is untouched.
    pub async fn remove_document(
        &self,
        ctx: &TenantContext,
        session_id: Uuid,
        document_id: Uuid,
    ) -> Result<()> {
        let session = self.get(ctx, session_id).await?;
        if !store::sessions::deactivate_session_document(&self.pool, session.id, document_id)
            .await?
        {
            return Err(SessionError::DocumentNotFound);
        }
        Ok(())
    }

    /// Active documents bridged into the session.
    pub async fn list_documents(
        &self,
        ctx: &TenantContext,
        session_id: Uuid,
    ) -> Result<Vec<Document>> {
        let session = self.get(ctx, session_id).await?;
        let bridges = store::sessions::list_session_documents(&self.pool, session.id).await?;
        let mut documents = Vec::with_capacity(bridges.len());
        for bridge in bridges {
            if let Some(document) =
                store::documents::get(&self.pool, ctx.tenant_id, bridge.document_id).await?
            {
                documents.push(document);
            }
        }
        Ok(documents)
    }

    pub async fn context(&self, ctx: &TenantContext, session_id: Uuid) -> Result<SessionContextView> {
        let session = self.get(ctx, session_id).await?;
        let documents = self.list_documents(ctx, session_id).await?;
        let ids: Vec<Uuid> = documents.iter().map(|d| d.id).collect();
        let total_chunks = store::documents::total_chunks(&self.pool, ctx.tenant_id, &ids).await?;
        Ok(SessionContextView {
            mode: session.mode,
            total_documents: documents.len(),
            total_chunks,
            active_documents: documents,
        })
    }

    pub async fn messages(
        &self,
        ctx: &TenantContext,
        session_id: Uuid,
        limit: i64,
    ) -> Result<Vec<StoredMessage>> {
        let session = self.get(ctx, session_id).await?;
        Ok(store::sessions::list_messages(&self.pool, session.id, limit).await?)
    }

    /// Append a message directly (the non-workflow path of the messages
    /// endpoint). Also upgrades a default title from the first user input.
    pub async fn add_message(
        &self,
        ctx: &TenantContext,
        session_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<StoredMessage> {
        if content.trim().is_empty() {
            return Err(SessionError::Validation("content must not be empty".into()));
        }
        let session = self.get(ctx, session_id).await?;
        let message = StoredMessage {
            id: Uuid::new_v4(),
            session_id: session.id,
            role,
            content: content.to_string(),
            metadata: json!({}),
            created_at: Utc::now(),
        };
        store::sessions::insert_message(&self.pool, &message).await?;
        if session.title == DEFAULT_TITLE && role == Role::User {
            let title = derive_title(content);
            sqlx::query("UPDATE conversation_sessions SET title = ?1 WHERE id = ?2")
                .bind(&title)
                .bind(session.id.to_string())
                .execute(&self.pool)
                .await
                .map_err(StoreError::from)?;
        }
        store::sessions::touch(&self.pool, session.id).await?;
        Ok(message)
    }
}

fn derive_title(content: &str) -> String {
    let flattened = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flattened.chars().count() <= TITLE_CHARS {
        flattened
    } else {
        let mut title: String = flattened.chars().take(TITLE_CHARS).collect();
        title.push('…');
        title
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_are_flattened_and_truncated() {
        assert_eq!(derive_title("short  question\nhere"), "short question here");
        let long = "w ".repeat(100);
        assert!(derive_title(&long).chars().count() <= TITLE_CHARS + 1);
    }
}
