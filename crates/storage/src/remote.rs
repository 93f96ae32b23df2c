//! Remote replica client. The sync service only sees the `RemoteReplica`
//! trait; the HTTP implementation talks to the replica's artifact endpoints.

use async_trait::async_trait;
use pagevault_core::types::CapturedArtifact;
use pagevault_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One remote-side change, tagged with the replica's change sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteChange {
    pub seq: i64,
    pub artifact: CapturedArtifact,
}

#[derive(Debug, Deserialize)]
struct ChangesPage {
    changes: Vec<RemoteChange>,
}

#[derive(Debug, Deserialize)]
struct PendingCount {
    pending: u64,
}

/// Replica operations the sync service needs. Upserts are keyed by artifact
/// id so replays are harmless.
#[async_trait]
pub trait RemoteReplica: Send + Sync {
    /// Changes strictly after the given cursor, oldest first.
    async fn fetch_changes(&self, after: &str, limit: u32) -> Result<Vec<RemoteChange>>;

    /// Idempotent batch write; re-sending an already-applied batch is a no-op.
    async fn upsert_batch(&self, batch: &[CapturedArtifact]) -> Result<()>;

    /// Number of remote changes still unseen past the cursor.
    async fn count_changes(&self, after: &str) -> Result<u64>;
}

pub struct HttpReplica {
    base: url::Url,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl HttpReplica {
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self> {
        let base = url::Url::parse(base_url)
            .map_err(|e| Error::Config(format!("remote url is malformed: {}", e)))?;
        Ok(Self {
            base,
            auth_token,
            client: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<url::Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Config(format!("remote url join failed: {}", e)))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl RemoteReplica for HttpReplica {
    async fn fetch_changes(&self, after: &str, limit: u32) -> Result<Vec<RemoteChange>> {
        let mut url = self.endpoint("v1/artifacts/changes")?;
        url.query_pairs_mut()
            .append_pair("after", after)
            .append_pair("limit", &limit.to_string());

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| Error::Remote(format!("change fetch failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Remote(format!(
                "change fetch returned {}",
                response.status()
            )));
        }
        let page: ChangesPage = response
            .json()
            .await
            .map_err(|e| Error::Remote(format!("change decode failed: {}", e)))?;
        debug!(count = page.changes.len(), after, "Fetched remote changes");
        Ok(page.changes)
    }

    async fn upsert_batch(&self, batch: &[CapturedArtifact]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let url = self.endpoint("v1/artifacts/batch")?;
        let response = self
            .authorize(self.client.post(url))
            .json(batch)
            .send()
            .await
            .map_err(|e| Error::Remote(format!("batch upsert failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Remote(format!(
                "batch upsert returned {}",
                response.status()
            )));
        }
        debug!(count = batch.len(), "Pushed artifact batch to replica");
        Ok(())
    }

    async fn count_changes(&self, after: &str) -> Result<u64> {
        let mut url = self.endpoint("v1/artifacts/changes/count")?;
        url.query_pairs_mut().append_pair("after", after);

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| Error::Remote(format!("pending count failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Remote(format!(
                "pending count returned {}",
                response.status()
            )));
        }
        let count: PendingCount = response
            .json()
            .await
            .map_err(|e| Error::Remote(format!("pending count decode failed: {}", e)))?;
        Ok(count.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_malformed_base_url() {
        assert!(matches!(
            HttpReplica::new("::not-a-url::", None),
            Err(Error::Config(_))
        ));
        assert!(HttpReplica::new("https://replica.example.com/", Some("tok".into())).is_ok());
    }
}
