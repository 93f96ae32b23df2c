use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Render a timestamp in the fixed-width form stored in SQLite TEXT columns.
/// Fixed fractional width keeps lexicographic order equal to chronological
/// order, which the sync cursors rely on.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time truncated to the precision the store persists, so a record
/// read back compares equal to the one written.
pub fn now_ts() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond(now.nanosecond() / 1000 * 1000)
        .unwrap_or(now)
}

/// Capture format of a stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Png,
    Jpeg,
    Webp,
    Pdf,
}

impl ArtifactFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactFormat::Png => "png",
            ArtifactFormat::Jpeg => "jpeg",
            ArtifactFormat::Webp => "webp",
            ArtifactFormat::Pdf => "pdf",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "png" => Some(ArtifactFormat::Png),
            "jpeg" | "jpg" => Some(ArtifactFormat::Jpeg),
            "webp" => Some(ArtifactFormat::Webp),
            "pdf" => Some(ArtifactFormat::Pdf),
            _ => None,
        }
    }
}

/// A captured browser artifact as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedArtifact {
    pub id: String,
    pub instance_id: String,
    pub session_id: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
    /// SHA-256 hex of the captured content bytes. Identical content captured
    /// in the same tenant/session scope resolves to the same hash.
    pub hash: String,
    pub storage_path: String,
    pub format: ArtifactFormat,
    pub byte_size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub full_page: bool,
    pub quality: Option<u8>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Bumped on every content-meaningful mutation; push watermark and
    /// last-write-wins timestamp for sync.
    pub updated_at: DateTime<Utc>,
    pub accessed_at: Option<DateTime<Utc>>,
}

/// Input for creating an artifact record. The store assigns `id` and the
/// timestamps when `id` is absent.
#[derive(Debug, Clone, Default)]
pub struct NewArtifact {
    pub id: Option<String>,
    pub instance_id: String,
    pub session_id: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub hash: String,
    pub storage_path: String,
    pub format: Option<ArtifactFormat>,
    pub byte_size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub full_page: bool,
    pub quality: Option<u8>,
    pub tags: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

/// One row of the append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: i64,
    pub instance_id: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub tool_name: String,
    pub created_at: DateTime<Utc>,
    pub input_summary: String,
    pub result_summary: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Input for appending an audit entry; `seq` and `created_at` are assigned
/// by the store.
#[derive(Debug, Clone, Default)]
pub struct NewAuditEntry {
    pub instance_id: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub tool_name: String,
    pub input_summary: String,
    pub result_summary: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderField {
    CreatedAt,
    AccessedAt,
    ByteSize,
}

impl OrderField {
    pub fn column(&self) -> &'static str {
        match self {
            OrderField::CreatedAt => "created_at",
            OrderField::AccessedAt => "accessed_at",
            OrderField::ByteSize => "byte_size",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl OrderDirection {
    pub fn sql(&self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

/// Filter + pagination descriptor for artifact listing. All filters are
/// optional; ordering is made total by a secondary `id ASC` tie-break so
/// pagination stays stable.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactQuery {
    pub instance_id: Option<String>,
    pub session_id: Option<String>,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub tag: Option<String>,
    pub format: Option<ArtifactFormat>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub max_age_secs: Option<i64>,
    pub limit: u32,
    pub offset: u64,
    pub order_by: OrderField,
    pub order: OrderDirection,
}

impl Default for ArtifactQuery {
    fn default() -> Self {
        Self {
            instance_id: None,
            session_id: None,
            tenant_id: None,
            user_id: None,
            tag: None,
            format: None,
            created_after: None,
            created_before: None,
            max_age_secs: None,
            limit: 50,
            offset: 0,
            order_by: OrderField::CreatedAt,
            order: OrderDirection::Desc,
        }
    }
}

/// One page of artifact listing results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResult {
    pub items: Vec<CapturedArtifact>,
    pub total: u64,
    pub has_more: bool,
    pub next_offset: Option<u64>,
}

impl ListResult {
    pub fn page(items: Vec<CapturedArtifact>, total: u64, offset: u64) -> Self {
        let has_more = offset + (items.len() as u64) < total;
        let next_offset = has_more.then(|| offset + items.len() as u64);
        Self {
            items,
            total,
            has_more,
            next_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_roundtrip() {
        for f in [
            ArtifactFormat::Png,
            ArtifactFormat::Jpeg,
            ArtifactFormat::Webp,
            ArtifactFormat::Pdf,
        ] {
            assert_eq!(ArtifactFormat::from_str(f.as_str()), Some(f));
        }
        assert_eq!(ArtifactFormat::from_str("gif"), None);
        assert_eq!(ArtifactFormat::from_str("jpg"), Some(ArtifactFormat::Jpeg));
    }

    #[test]
    fn test_list_result_page_flags() {
        let r = ListResult::page(Vec::new(), 0, 0);
        assert!(!r.has_more);
        assert_eq!(r.next_offset, None);

        let items: Vec<CapturedArtifact> = Vec::new();
        let r = ListResult::page(items, 10, 10);
        assert!(!r.has_more);
    }

    #[test]
    fn test_format_ts_fixed_width() {
        let a = format_ts(&Utc::now());
        assert!(a.ends_with('Z'));
        // 2026-08-05T12:34:56.789012Z
        assert_eq!(a.len(), 27);
    }
}
