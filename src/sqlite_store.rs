//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation onto the schema created by
//! [`migrate`](crate::migrate). Chunk vectors live inline in the `chunks`
//! table as little-endian `f32` BLOBs; similarity is computed in Rust by
//! the core retriever.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use casefile_core::embedding::{blob_to_vec, vec_to_blob};
use casefile_core::error::{Error, Result};
use casefile_core::models::{
    label_for_index, Chunk, Citation, Conversation, Document, DocumentStatus, Message, NewMessage,
    Role, ScopedChunk,
};
use casefile_core::store::Store;

/// SQLite implementation of the [`Store`] trait.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Store(e.to_string())
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let ordinal: i64 = row.get("ordinal");
    let status: String = row.get("status");
    Ok(Document {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        filename: row.get("filename"),
        label: label_for_index(ordinal as usize),
        ordinal,
        page_count: row.get::<i64, _>("page_count") as u32,
        status: status.parse()?,
        uploaded_at: row.get("uploaded_at"),
    })
}

fn row_to_conversation(row: &SqliteRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        title: row.get("title"),
        created_at: row.get("created_at"),
    }
}

fn row_to_citation(row: &SqliteRow) -> Result<Citation> {
    let kind: String = row.get("kind");
    match kind.as_str() {
        "document" => Ok(Citation::Document {
            doc_label: row.get::<Option<String>, _>("doc_label").unwrap_or_default(),
            document_id: row.get::<Option<String>, _>("document_id").unwrap_or_default(),
            page: row.get::<Option<i64>, _>("page").unwrap_or(0) as u32,
            section: row.get("section"),
            quote: row.get::<Option<String>, _>("quote").unwrap_or_default(),
        }),
        "web" => Ok(Citation::Web {
            url: row.get::<Option<String>, _>("url").unwrap_or_default(),
            title: row.get::<Option<String>, _>("title").unwrap_or_default(),
            summary: row.get::<Option<String>, _>("quote").unwrap_or_default(),
        }),
        other => Err(Error::Serialization(format!(
            "unknown citation kind: {}",
            other
        ))),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_conversation(&self, title: Option<&str>) -> Result<Conversation> {
        let conv = Conversation {
            id: Uuid::new_v4().to_string(),
            title: title.map(str::to_string),
            created_at: now(),
        };
        sqlx::query("INSERT INTO conversations (id, title, created_at) VALUES (?, ?, ?)")
            .bind(&conv.id)
            .bind(&conv.title)
            .bind(conv.created_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(conv)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT id, title, created_at FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(row_to_conversation))
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT id, title, created_at FROM conversations ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(row_to_conversation).collect())
    }

    async fn set_conversation_title(&self, id: &str, title: &str) -> Result<()> {
        let result = sqlx::query("UPDATE conversations SET title = ? WHERE id = ?")
            .bind(title)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("conversation {}", id)));
        }
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_document(
        &self,
        conversation_id: &str,
        filename: &str,
        page_count: u32,
    ) -> Result<Document> {
        let id = Uuid::new_v4().to_string();
        let uploaded_at = now();

        // The counter only grows, so a deleted document's label is never reused.
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            "UPDATE conversations SET next_ordinal = next_ordinal + 1 WHERE id = ? \
             RETURNING next_ordinal - 1 AS ordinal",
        )
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))?;
        let ordinal: i64 = row.get("ordinal");

        sqlx::query(
            r#"
            INSERT INTO documents (id, conversation_id, filename, ordinal, page_count, status, uploaded_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(filename)
        .bind(ordinal)
        .bind(page_count as i64)
        .bind(uploaded_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(Document {
            id,
            conversation_id: conversation_id.to_string(),
            filename: filename.to_string(),
            label: label_for_index(ordinal as usize),
            ordinal,
            page_count,
            status: DocumentStatus::Pending,
            uploaded_at,
        })
    }

    async fn commit_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<()> {
        if chunks.len() != vectors.len() {
            return Err(Error::EmbeddingBatchFailed(format!(
                "{} chunks but {} vectors",
                chunks.len(),
                vectors.len()
            )));
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for (chunk, vector) in chunks.iter().zip(vectors) {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, text, context, section,
                                    page_number, token_count, hash, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.context)
            .bind(&chunk.section)
            .bind(chunk.page_number as i64)
            .bind(chunk.token_count as i64)
            .bind(&chunk.hash)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        let result =
            sqlx::query("UPDATE documents SET status = 'ready' WHERE id = ? AND status = 'pending'")
                .bind(document_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        if result.rows_affected() == 0 {
            // Dropping the transaction rolls back the inserted chunks.
            return Err(Error::InvalidInput(format!(
                "document {} is missing or not pending",
                document_id
            )));
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn mark_failed(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE documents SET status = 'failed' WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(&self, conversation_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents WHERE conversation_id = ? ORDER BY ordinal")
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_document).collect()
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn scoped_chunks(
        &self,
        conversation_id: &str,
        document_ids: Option<&[String]>,
    ) -> Result<Vec<ScopedChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.chunk_index, c.text, c.context, c.section,
                   c.page_number, c.token_count, c.hash, c.embedding,
                   d.ordinal, d.filename
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.conversation_id = ? AND d.status = 'ready'
            ORDER BY d.ordinal, c.chunk_index
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let out = rows
            .iter()
            .filter(|row| {
                let doc_id: String = row.get("document_id");
                document_ids.map_or(true, |ids| ids.contains(&doc_id))
            })
            .map(|row| {
                let ordinal: i64 = row.get("ordinal");
                let blob: Vec<u8> = row.get("embedding");
                ScopedChunk {
                    chunk: Chunk {
                        id: row.get("id"),
                        document_id: row.get("document_id"),
                        chunk_index: row.get("chunk_index"),
                        text: row.get("text"),
                        context: row.get("context"),
                        section: row.get("section"),
                        page_number: row.get::<i64, _>("page_number") as u32,
                        token_count: row.get::<i64, _>("token_count") as usize,
                        hash: row.get("hash"),
                    },
                    embedding: blob_to_vec(&blob),
                    document_label: label_for_index(ordinal as usize),
                    filename: row.get("filename"),
                    document_ordinal: ordinal,
                }
            })
            .collect();

        Ok(out)
    }

    async fn save_message(&self, message: NewMessage) -> Result<Message> {
        let id = Uuid::new_v4().to_string();
        let created_at = now();
        let sources_cited = match message.role {
            Role::Assistant => message.citations.len(),
            Role::User => 0,
        };

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, sources_cited, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(sources_cited as i64)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            let missing_conversation =
                matches!(&e, sqlx::Error::Database(db) if db.is_foreign_key_violation());
            if missing_conversation {
                Error::NotFound(format!("conversation {}", message.conversation_id))
            } else {
                db_err(e)
            }
        })?;

        for (position, citation) in message.citations.iter().enumerate() {
            let q = sqlx::query(
                r#"
                INSERT INTO citations (id, message_id, position, kind, doc_label, document_id,
                                       page, section, quote, url, title)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&id)
            .bind(position as i64)
            .bind(citation.kind());

            let q = match citation {
                Citation::Document {
                    doc_label,
                    document_id,
                    page,
                    section,
                    quote,
                } => q
                    .bind(Some(doc_label))
                    .bind(Some(document_id))
                    .bind(Some(*page as i64))
                    .bind(section)
                    .bind(Some(quote))
                    .bind(None::<String>)
                    .bind(None::<String>),
                Citation::Web {
                    url,
                    title,
                    summary,
                } => q
                    .bind(None::<String>)
                    .bind(None::<String>)
                    .bind(None::<i64>)
                    .bind(None::<String>)
                    .bind(Some(summary))
                    .bind(Some(url))
                    .bind(Some(title)),
            };
            q.execute(&mut *tx).await.map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;

        Ok(Message {
            id,
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content,
            sources_cited,
            created_at,
            citations: message.citations,
        })
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at, rowid",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("id");
            let citation_rows =
                sqlx::query("SELECT * FROM citations WHERE message_id = ? ORDER BY position")
                    .bind(&id)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(db_err)?;
            let citations = citation_rows
                .iter()
                .map(row_to_citation)
                .collect::<Result<Vec<_>>>()?;
            let role: String = row.get("role");

            messages.push(Message {
                id,
                conversation_id: row.get("conversation_id"),
                role: role.parse::<Role>()?,
                content: row.get("content"),
                sources_cited: row.get::<i64, _>("sources_cited") as usize,
                created_at: row.get("created_at"),
                citations,
            });
        }

        Ok(messages)
    }
}
