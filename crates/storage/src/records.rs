//! Typed CRUD and paginated query over captured artifacts, plus the
//! append-only audit trail. All operations run through the backend's
//! transactional unit-of-work.

use crate::backend::StoreBackend;
use crate::cache::{CacheScope, ReadCache};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pagevault_core::types::{
    format_ts, now_ts, ArtifactFormat, ArtifactQuery, AuditEntry, CapturedArtifact, ListResult,
    NewArtifact, NewAuditEntry,
};
use pagevault_core::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const ARTIFACT_COLUMNS: &str = "id, instance_id, session_id, tenant_id, user_id, hash, \
     storage_path, format, byte_size, width, height, full_page, quality, tags, metadata, \
     created_at, updated_at, accessed_at";

#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<StoreBackend>,
    cache: Arc<ReadCache>,
    cache_ttl: Duration,
}

enum CreateOutcome {
    Fresh(CapturedArtifact),
    Dedup(CapturedArtifact),
}

impl RecordStore {
    pub fn new(backend: Arc<StoreBackend>, cache: Arc<ReadCache>, cache_ttl: Duration) -> Self {
        Self {
            backend,
            cache,
            cache_ttl,
        }
    }

    pub fn backend(&self) -> &Arc<StoreBackend> {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<ReadCache> {
        &self.cache
    }

    /// Store a captured artifact. Identical content in the same
    /// tenant/session scope dedups to the existing record; an explicit
    /// duplicate id is a conflict.
    pub fn create(&self, new: NewArtifact) -> Result<CapturedArtifact> {
        let outcome = self.backend.with_transaction(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM artifacts
                     WHERE tenant_id = ?1 AND session_id = ?2 AND hash = ?3
                     LIMIT 1",
                    params![new.tenant_id, new.session_id, new.hash],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| Error::Storage(format!("Dedup lookup failed: {}", e)))?;

            if let Some(id) = existing {
                let now = now_ts();
                conn.execute(
                    "UPDATE artifacts SET accessed_at = ?1 WHERE id = ?2",
                    params![format_ts(&now), id],
                )
                .map_err(|e| Error::Storage(format!("Dedup touch failed: {}", e)))?;
                let artifact = get_in_tx(conn, &id)?
                    .ok_or_else(|| Error::Storage(format!("Dedup hit vanished: {}", id)))?;
                return Ok(CreateOutcome::Dedup(artifact));
            }

            let id = new
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let duplicate: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM artifacts WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| Error::Storage(format!("Id lookup failed: {}", e)))?;
            if duplicate.is_some() {
                return Err(Error::Conflict(format!("artifact id already exists: {}", id)));
            }

            let now = now_ts();
            let artifact = CapturedArtifact {
                id,
                instance_id: new.instance_id.clone(),
                session_id: new.session_id.clone(),
                tenant_id: new.tenant_id.clone(),
                user_id: new.user_id.clone(),
                hash: new.hash.clone(),
                storage_path: new.storage_path.clone(),
                format: new.format.unwrap_or(ArtifactFormat::Png),
                byte_size: new.byte_size,
                width: new.width,
                height: new.height,
                full_page: new.full_page,
                quality: new.quality,
                tags: new.tags.clone(),
                metadata: new
                    .metadata
                    .clone()
                    .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new())),
                created_at: now,
                updated_at: now,
                accessed_at: None,
            };
            insert_in_tx(conn, &artifact)?;
            Ok(CreateOutcome::Fresh(artifact))
        })?;

        match outcome {
            CreateOutcome::Fresh(artifact) => {
                self.cache.invalidate(&CacheScope::of_record(&artifact));
                info!(id = %artifact.id, tenant = %artifact.tenant_id, "Artifact stored");
                Ok(artifact)
            }
            CreateOutcome::Dedup(artifact) => {
                self.cache.invalidate_record(&artifact.id);
                debug!(id = %artifact.id, hash = %artifact.hash, "Duplicate capture deduped");
                Ok(artifact)
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<CapturedArtifact> {
        self.backend.with_transaction(|conn| {
            get_in_tx(conn, id)?.ok_or_else(|| Error::NotFound(format!("artifact {}", id)))
        })
    }

    /// Paginated listing with a read-through cache in front. The count and
    /// the page select run in one transaction for a consistent snapshot.
    pub fn list(&self, query: &ArtifactQuery) -> Result<ListResult> {
        if let Some(hit) = self.cache.get(query) {
            return Ok(hit);
        }

        let result = self.backend.with_transaction(|conn| {
            let (where_sql, binds) = build_filter(query);

            let count_sql = format!("SELECT COUNT(*) FROM artifacts{}", where_sql);
            let bind_refs: Vec<&dyn rusqlite::types::ToSql> =
                binds.iter().map(|b| b.as_ref()).collect();
            let total: i64 = conn
                .query_row(&count_sql, bind_refs.as_slice(), |row| row.get(0))
                .map_err(|e| Error::Storage(format!("Count query failed: {}", e)))?;

            let page_sql = format!(
                "SELECT {} FROM artifacts{} ORDER BY {} {}, id ASC LIMIT ?{} OFFSET ?{}",
                ARTIFACT_COLUMNS,
                where_sql,
                query.order_by.column(),
                query.order.sql(),
                binds.len() + 1,
                binds.len() + 2,
            );
            let mut page_binds = bind_refs;
            let limit = query.limit as i64;
            let offset = query.offset as i64;
            page_binds.push(&limit);
            page_binds.push(&offset);

            let mut stmt = conn
                .prepare(&page_sql)
                .map_err(|e| Error::Storage(format!("List query failed: {}", e)))?;
            let rows = stmt
                .query_map(page_binds.as_slice(), map_artifact_row)
                .map_err(|e| Error::Storage(format!("List query failed: {}", e)))?;

            let mut items = Vec::new();
            for row in rows {
                items.push(row.map_err(|e| Error::Storage(format!("Row decode failed: {}", e)))?);
            }
            Ok(ListResult::page(items, total as u64, query.offset))
        })?;

        self.cache.put(query, result.clone(), self.cache_ttl);
        Ok(result)
    }

    /// Update the access timestamp only. Cache handling is single-record:
    /// pages that do not contain the artifact are left alone.
    pub fn touch_access(&self, id: &str) -> Result<()> {
        let updated = self.backend.with_transaction(|conn| {
            conn.execute(
                "UPDATE artifacts SET accessed_at = ?1 WHERE id = ?2",
                params![format_ts(&Utc::now()), id],
            )
            .map_err(|e| Error::Storage(format!("Touch failed: {}", e)))
        })?;
        if updated == 0 {
            return Err(Error::NotFound(format!("artifact {}", id)));
        }
        self.cache.invalidate_record(id);
        Ok(())
    }

    /// Replace metadata and tags; bumps `updated_at`, so the change is picked
    /// up by the next sync push.
    pub fn update_metadata(
        &self,
        id: &str,
        metadata: serde_json::Value,
        tags: Vec<String>,
    ) -> Result<CapturedArtifact> {
        let artifact = self.backend.with_transaction(|conn| {
            let mut artifact =
                get_in_tx(conn, id)?.ok_or_else(|| Error::NotFound(format!("artifact {}", id)))?;
            artifact.metadata = metadata.clone();
            artifact.tags = tags.clone();
            artifact.updated_at = now_ts();
            conn.execute(
                "UPDATE artifacts SET metadata = ?1, tags = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    artifact.metadata.to_string(),
                    artifact.tags.join(","),
                    format_ts(&artifact.updated_at),
                    id
                ],
            )
            .map_err(|e| Error::Storage(format!("Metadata update failed: {}", e)))?;
            Ok(artifact)
        })?;
        self.cache.invalidate(&CacheScope::of_record(&artifact));
        Ok(artifact)
    }

    /// Append to the audit trail. Failures are never swallowed; callers
    /// report them alongside the tool result they belong to.
    pub fn append_audit(&self, entry: NewAuditEntry) -> Result<i64> {
        self.backend
            .with_transaction(|conn| {
                conn.execute(
                    "INSERT INTO audit_log (instance_id, tenant_id, user_id, tool_name,
                        created_at, input_summary, result_summary, error, duration_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        entry.instance_id,
                        entry.tenant_id,
                        entry.user_id,
                        entry.tool_name,
                        format_ts(&Utc::now()),
                        entry.input_summary,
                        entry.result_summary,
                        entry.error,
                        entry.duration_ms as i64,
                    ],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(conn.last_insert_rowid())
            })
            .map_err(|e| Error::AuditWrite(e.to_string()))
    }

    /// Most recent audit entries, newest first.
    pub fn audit_tail(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        self.backend.with_transaction(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT seq, instance_id, tenant_id, user_id, tool_name, created_at,
                        input_summary, result_summary, error, duration_ms
                     FROM audit_log ORDER BY seq DESC LIMIT ?1",
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok(AuditEntry {
                        seq: row.get(0)?,
                        instance_id: row.get(1)?,
                        tenant_id: row.get(2)?,
                        user_id: row.get(3)?,
                        tool_name: row.get(4)?,
                        created_at: parse_ts_column(row, 5)?,
                        input_summary: row.get(6)?,
                        result_summary: row.get(7)?,
                        error: row.get(8)?,
                        duration_ms: row.get::<_, i64>(9)? as u64,
                    })
                })
                .map_err(|e| Error::Storage(e.to_string()))?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(|e| Error::Storage(e.to_string()))?);
            }
            Ok(entries)
        })
    }

    pub fn artifact_count(&self) -> Result<u64> {
        self.backend.with_transaction(|conn| {
            conn.query_row("SELECT COUNT(*) FROM artifacts", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
            .map_err(|e| Error::Storage(e.to_string()))
        })
    }

    pub fn audit_count(&self) -> Result<u64> {
        self.backend.with_transaction(|conn| {
            conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
            .map_err(|e| Error::Storage(e.to_string()))
        })
    }

    /// Rows whose `updated_at` is strictly after the given watermark,
    /// oldest first. Used by the sync push phase.
    pub(crate) fn modified_since(&self, after: &str, limit: u32) -> Result<Vec<CapturedArtifact>> {
        self.backend.with_transaction(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM artifacts WHERE updated_at > ?1
                     ORDER BY updated_at ASC, id ASC LIMIT ?2",
                    ARTIFACT_COLUMNS
                ))
                .map_err(|e| Error::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params![after, limit as i64], map_artifact_row)
                .map_err(|e| Error::Storage(e.to_string()))?;
            let mut items = Vec::new();
            for row in rows {
                items.push(row.map_err(|e| Error::Storage(e.to_string()))?);
            }
            Ok(items)
        })
    }

    pub(crate) fn pending_push_count(&self, after: &str) -> Result<u64> {
        self.backend.with_transaction(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM artifacts WHERE updated_at > ?1",
                params![after],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(|e| Error::Storage(e.to_string()))
        })
    }
}

fn build_filter(query: &ArtifactQuery) -> (String, Vec<Box<dyn rusqlite::types::ToSql>>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    let mut push = |clause: &str, value: Box<dyn rusqlite::types::ToSql>| {
        binds.push(value);
        clauses.push(clause.replace("{n}", &binds.len().to_string()));
    };

    if let Some(v) = &query.instance_id {
        push("instance_id = ?{n}", Box::new(v.clone()));
    }
    if let Some(v) = &query.session_id {
        push("session_id = ?{n}", Box::new(v.clone()));
    }
    if let Some(v) = &query.tenant_id {
        push("tenant_id = ?{n}", Box::new(v.clone()));
    }
    if let Some(v) = &query.user_id {
        push("user_id = ?{n}", Box::new(v.clone()));
    }
    if let Some(v) = &query.tag {
        push(
            "(',' || tags || ',') LIKE ('%,' || ?{n} || ',%')",
            Box::new(v.clone()),
        );
    }
    if let Some(v) = &query.format {
        push("format = ?{n}", Box::new(v.as_str().to_string()));
    }
    if let Some(v) = &query.created_after {
        push("created_at >= ?{n}", Box::new(format_ts(v)));
    }
    if let Some(v) = &query.created_before {
        push("created_at <= ?{n}", Box::new(format_ts(v)));
    }
    if let Some(age) = query.max_age_secs {
        let cutoff = Utc::now() - ChronoDuration::seconds(age);
        push("created_at >= ?{n}", Box::new(format_ts(&cutoff)));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    (where_sql, binds)
}

fn parse_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn map_artifact_row(row: &Row<'_>) -> rusqlite::Result<CapturedArtifact> {
    let format_raw: String = row.get(7)?;
    let tags_raw: String = row.get(13)?;
    let metadata_raw: String = row.get(14)?;
    let accessed_raw: Option<String> = row.get(17)?;

    let accessed_at = match accessed_raw {
        Some(s) => Some(
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        17,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?,
        ),
        None => None,
    };

    Ok(CapturedArtifact {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        session_id: row.get(2)?,
        tenant_id: row.get(3)?,
        user_id: row.get(4)?,
        hash: row.get(5)?,
        storage_path: row.get(6)?,
        format: ArtifactFormat::from_str(&format_raw).unwrap_or(ArtifactFormat::Png),
        byte_size: row.get::<_, i64>(8)? as u64,
        width: row.get::<_, Option<i64>>(9)?.map(|v| v as u32),
        height: row.get::<_, Option<i64>>(10)?.map(|v| v as u32),
        full_page: row.get::<_, i64>(11)? != 0,
        quality: row.get::<_, Option<i64>>(12)?.map(|v| v as u8),
        tags: if tags_raw.is_empty() {
            Vec::new()
        } else {
            tags_raw.split(',').map(|s| s.to_string()).collect()
        },
        metadata: serde_json::from_str(&metadata_raw).unwrap_or_else(|_| {
            serde_json::Value::Object(serde_json::Map::new())
        }),
        created_at: parse_ts_column(row, 15)?,
        updated_at: parse_ts_column(row, 16)?,
        accessed_at,
    })
}

pub(crate) fn get_in_tx(conn: &Connection, id: &str) -> Result<Option<CapturedArtifact>> {
    conn.query_row(
        &format!("SELECT {} FROM artifacts WHERE id = ?1", ARTIFACT_COLUMNS),
        params![id],
        map_artifact_row,
    )
    .optional()
    .map_err(|e| Error::Storage(format!("Get failed: {}", e)))
}

pub(crate) fn insert_in_tx(conn: &Connection, artifact: &CapturedArtifact) -> Result<()> {
    let values = artifact_params(artifact);
    let refs: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|b| b.as_ref()).collect();
    conn.execute(
        "INSERT INTO artifacts (id, instance_id, session_id, tenant_id, user_id, hash,
            storage_path, format, byte_size, width, height, full_page, quality, tags,
            metadata, created_at, updated_at, accessed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        refs.as_slice(),
    )
    .map_err(|e| Error::Storage(format!("Insert failed: {}", e)))?;
    Ok(())
}

/// Idempotent write keyed by id; the sync apply path uses this so re-running
/// a partially completed cycle cannot duplicate rows.
pub(crate) fn upsert_in_tx(conn: &Connection, artifact: &CapturedArtifact) -> Result<()> {
    let values = artifact_params(artifact);
    let refs: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|b| b.as_ref()).collect();
    conn.execute(
        "INSERT INTO artifacts (id, instance_id, session_id, tenant_id, user_id, hash,
            storage_path, format, byte_size, width, height, full_page, quality, tags,
            metadata, created_at, updated_at, accessed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
         ON CONFLICT(id) DO UPDATE SET
            instance_id = excluded.instance_id,
            session_id = excluded.session_id,
            tenant_id = excluded.tenant_id,
            user_id = excluded.user_id,
            hash = excluded.hash,
            storage_path = excluded.storage_path,
            format = excluded.format,
            byte_size = excluded.byte_size,
            width = excluded.width,
            height = excluded.height,
            full_page = excluded.full_page,
            quality = excluded.quality,
            tags = excluded.tags,
            metadata = excluded.metadata,
            updated_at = excluded.updated_at,
            accessed_at = excluded.accessed_at",
        refs.as_slice(),
    )
    .map_err(|e| Error::Storage(format!("Upsert failed: {}", e)))?;
    Ok(())
}

fn artifact_params(artifact: &CapturedArtifact) -> Vec<Box<dyn rusqlite::types::ToSql>> {
    vec![
        Box::new(artifact.id.clone()),
        Box::new(artifact.instance_id.clone()),
        Box::new(artifact.session_id.clone()),
        Box::new(artifact.tenant_id.clone()),
        Box::new(artifact.user_id.clone()),
        Box::new(artifact.hash.clone()),
        Box::new(artifact.storage_path.clone()),
        Box::new(artifact.format.as_str().to_string()),
        Box::new(artifact.byte_size as i64),
        Box::new(artifact.width.map(|v| v as i64)),
        Box::new(artifact.height.map(|v| v as i64)),
        Box::new(artifact.full_page as i64),
        Box::new(artifact.quality.map(|v| v as i64)),
        Box::new(artifact.tags.join(",")),
        Box::new(artifact.metadata.to_string()),
        Box::new(format_ts(&artifact.created_at)),
        Box::new(format_ts(&artifact.updated_at)),
        Box::new(artifact.accessed_at.as_ref().map(format_ts)),
    ]
}
