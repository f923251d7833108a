use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use url::Url;

use quarry_core::{BackendError, IndexBackend, IteratorHandle, PopResult, QueryResult, Topology};

/// HTTP JSON client for the index backend.
///
/// Every reply is either the expected payload or an `{"error": "..."}`
/// object; the latter surfaces as [`BackendError::Api`].
#[derive(Debug, Clone)]
pub struct HttpIndexBackend {
    http: reqwest::Client,
    base: String,
}

/// Backend replies carry errors in-band rather than as HTTP statuses.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Reply<T> {
    Err {
        error: String,
    },
    Ok(T),
}

impl<T> Reply<T> {
    fn into_result(self) -> Result<T, BackendError> {
        match self {
            Reply::Err { error } => Err(BackendError::Api(error)),
            Reply::Ok(payload) => Ok(payload),
        }
    }
}

#[derive(Debug, Serialize)]
struct QueryBody<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    taint: Option<&'a str>,
    dataset: &'a str,
}

#[derive(Debug, Serialize)]
struct PopBody {
    count: usize,
}

impl HttpIndexBackend {
    /// Build a client for the backend at `url`.
    pub fn from_url(url: &str) -> Result<Self, url::ParseError> {
        let base = Url::parse(url)?;
        Ok(Self {
            http: reqwest::Client::new(),
            base: base.as_str().trim_end_matches('/').to_owned(),
        })
    }

    /// The backend endpoint this client talks to.
    pub fn url(&self) -> &str {
        &self.base
    }
}

#[async_trait]
impl IndexBackend for HttpIndexBackend {
    #[instrument(skip(self), err)]
    async fn topology(&self) -> Result<Topology, BackendError> {
        let res = self
            .http
            .get(format!("{}/topology", self.base))
            .send()
            .await
            .map_err(BackendError::connection)?;
        let reply: Reply<Topology> = res.json().await.map_err(BackendError::connection)?;
        reply.into_result()
    }

    #[instrument(skip(self, query), err)]
    async fn query(
        &self,
        query: &str,
        taint: &Option<String>,
        dataset: &str,
    ) -> Result<QueryResult, BackendError> {
        let res = self
            .http
            .post(format!("{}/query", self.base))
            .json(&QueryBody {
                query,
                taint: taint.as_deref(),
                dataset,
            })
            .send()
            .await
            .map_err(BackendError::connection)?;
        let reply: Reply<QueryResult> = res.json().await.map_err(BackendError::connection)?;
        reply.into_result()
    }

    #[instrument(skip(self), err)]
    async fn pop(
        &self,
        iterator: &IteratorHandle,
        count: usize,
    ) -> Result<PopResult, BackendError> {
        let res = self
            .http
            .post(format!("{}/iterator/{}/pop", self.base, iterator))
            .json(&PopBody { count })
            .send()
            .await
            .map_err(BackendError::connection)?;
        let reply: Reply<PopResult> = res.json().await.map_err(BackendError::connection)?;
        reply.into_result()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_objects_win_over_payloads() {
        let reply: Reply<PopResult> =
            serde_json::from_str(r#"{"error": "iterator expired"}"#).unwrap();
        assert!(matches!(
            reply.into_result(),
            Err(BackendError::Api(msg)) if msg == "iterator expired"
        ));

        let reply: Reply<PopResult> =
            serde_json::from_str(r#"{"files": ["/mnt/samples/a"], "iterator_empty": false}"#)
                .unwrap();
        let popped = reply.into_result().unwrap();
        assert_eq!(popped.files, vec!["/mnt/samples/a"]);
        assert!(!popped.iterator_empty);
    }

    #[test]
    fn topology_reply_parses_dataset_map() {
        let reply: Reply<Topology> =
            serde_json::from_str(r#"{"datasets": {"set-2023": {"size": 10}}}"#).unwrap();
        let topology = reply.into_result().unwrap();
        assert!(topology.datasets.contains_key("set-2023"));
    }
}
