//! Implements the `Remote` trait against a PostgREST-style REST endpoint.

use crate::error::Res;
use crate::remote::{Collection, Filter, Remote};
use anyhow::{bail, Context};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{RequestBuilder, Response};
use serde_json::Value;
use tracing::trace;
use url::Url;

const REST_PATH: &str = "rest/v1/";

/// Talks to `{base}/rest/v1/{collection}` with the API key in both the `apikey` header and as a
/// bearer token.
pub(crate) struct HttpRemote {
    base: Url,
    client: reqwest::Client,
}

impl HttpRemote {
    pub(crate) fn new(base_url: &str, api_key: String) -> Res<Self> {
        let mut base =
            Url::parse(base_url).with_context(|| format!("Invalid remote_url '{base_url}'"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&api_key).context("The API key is not a valid header")?;
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .context("The API key is not a valid header")?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Unable to build the HTTP client")?;
        Ok(Self { base, client })
    }

    fn url(&self, collection: Collection) -> Res<Url> {
        self.base
            .join(REST_PATH)
            .and_then(|u| u.join(&collection.to_string()))
            .with_context(|| format!("Unable to build the URL for {collection}"))
    }

    fn owner_url(&self, collection: Collection, filter: &Filter) -> Res<Url> {
        let mut url = self.url(collection)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("user_id", &format!("eq.{}", filter.owner_id));
            if let Some(id) = &filter.id {
                query.append_pair("id", &format!("eq.{id}"));
            }
        }
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Res<Response> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send {what} request"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());
            bail!("The remote {what} request failed with status {status}: {body}");
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl Remote for HttpRemote {
    async fn select(&self, collection: Collection, owner_id: &str) -> Res<Vec<Value>> {
        trace!("select {collection} for {owner_id}");
        let mut url = self.owner_url(collection, &Filter::owner(owner_id))?;
        url.query_pairs_mut().append_pair("select", "*");
        let response = self.send(self.client.get(url), "select").await?;
        response
            .json()
            .await
            .with_context(|| format!("Unable to parse {collection} rows"))
    }

    async fn upsert(&self, collection: Collection, rows: &[Value], on_conflict: &str) -> Res<()> {
        trace!("upsert {} {collection} row(s) on {on_conflict}", rows.len());
        let mut url = self.url(collection)?;
        url.query_pairs_mut().append_pair("on_conflict", on_conflict);
        let request = self
            .client
            .post(url)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows);
        self.send(request, "upsert").await?;
        Ok(())
    }

    async fn delete(&self, collection: Collection, filter: &Filter) -> Res<()> {
        trace!("delete {collection} for {filter:?}");
        let url = self.owner_url(collection, filter)?;
        self.send(self.client.delete(url), "delete").await?;
        Ok(())
    }

    async fn insert(&self, collection: Collection, rows: &[Value]) -> Res<()> {
        trace!("insert {} {collection} row(s)", rows.len());
        let url = self.url(collection)?;
        let request = self
            .client
            .post(url)
            .header("Prefer", "return=minimal")
            .json(rows);
        self.send(request, "insert").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let remote = HttpRemote::new("https://example.com/base", "key".to_string()).unwrap();
        assert_eq!(
            remote.url(Collection::Expenses).unwrap().as_str(),
            "https://example.com/base/rest/v1/expenses"
        );
        let url = remote
            .owner_url(Collection::BudgetPeriods, &Filter::row("o1", "p1"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/base/rest/v1/budget_periods?user_id=eq.o1&id=eq.p1"
        );
    }

    #[test]
    fn test_invalid_url() {
        assert!(HttpRemote::new("not a url", "key".to_string()).is_err());
    }
}
