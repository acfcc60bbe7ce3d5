use crate::error::{PghaError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Load balancer backend management
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Backends (`host:port`) currently registered on `lb_addr`
    async fn list_backends(&self, lb_addr: &str) -> Result<Vec<String>>;

    async fn add_backend(&self, lb_addr: &str, backend: &str) -> Result<()>;

    async fn delete_backend(&self, lb_addr: &str, backend: &str) -> Result<()>;
}

/// HTTP adapter: `http://{lb}/backend/{list|add|delete}?backend=..&token=..`
pub struct HttpLoadBalancer {
    client: reqwest::Client,
    token: String,
}

impl HttpLoadBalancer {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            token: token.into(),
        }
    }

    async fn get(&self, lb_addr: &str, action: &str, backend: Option<&str>) -> Result<String> {
        let url = format!("http://{}/backend/{}", lb_addr, action);
        let mut query: Vec<(&str, &str)> = Vec::with_capacity(2);
        if let Some(backend) = backend {
            query.push(("backend", backend));
        }
        query.push(("token", self.token.as_str()));

        debug!("load balancer request {} {:?}", url, backend);
        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| PghaError::LoadBalancer(format!("{}: {}", lb_addr, e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PghaError::LoadBalancer(format!("{}: {}", lb_addr, e)))?;
        if !status.is_success() {
            return Err(PghaError::LoadBalancer(format!(
                "{} {} returned {}: {}",
                lb_addr,
                action,
                status.as_u16(),
                body
            )));
        }
        Ok(body)
    }
}

/// The list endpoint answers a JSON object keyed by backend address
pub fn parse_backend_list(body: &str) -> Result<Vec<String>> {
    let parsed: BTreeMap<String, serde_json::Value> = serde_json::from_str(body)?;
    Ok(parsed.into_keys().collect())
}

#[async_trait]
impl LoadBalancer for HttpLoadBalancer {
    async fn list_backends(&self, lb_addr: &str) -> Result<Vec<String>> {
        let body = self.get(lb_addr, "list", None).await?;
        parse_backend_list(&body)
    }

    async fn add_backend(&self, lb_addr: &str, backend: &str) -> Result<()> {
        self.get(lb_addr, "add", Some(backend)).await.map(|_| ())
    }

    async fn delete_backend(&self, lb_addr: &str, backend: &str) -> Result<()> {
        self.get(lb_addr, "delete", Some(backend)).await.map(|_| ())
    }
}

/// Difference between the desired and the registered backend sets:
/// `(to_add, to_delete)`, both sorted.
pub fn backend_diff(desired: &[String], registered: &[String]) -> (Vec<String>, Vec<String>) {
    let mut to_add: Vec<String> = desired
        .iter()
        .filter(|b| !registered.contains(b))
        .cloned()
        .collect();
    let mut to_delete: Vec<String> = registered
        .iter()
        .filter(|b| !desired.contains(b))
        .cloned()
        .collect();
    to_add.sort();
    to_add.dedup();
    to_delete.sort();
    to_delete.dedup();
    (to_add, to_delete)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend_list_takes_keys() {
        let body = r#"{"10.0.0.2:5432": {"weight": 1}, "10.0.0.3:5432": {}}"#;
        assert_eq!(
            parse_backend_list(body).unwrap(),
            vec!["10.0.0.2:5432", "10.0.0.3:5432"]
        );
        assert!(parse_backend_list("[1, 2]").is_err());
    }

    #[test]
    fn test_backend_diff() {
        let desired = vec!["a:1".to_string(), "b:1".to_string()];
        let registered = vec!["b:1".to_string(), "c:1".to_string()];
        let (add, del) = backend_diff(&desired, &registered);
        assert_eq!(add, vec!["a:1"]);
        assert_eq!(del, vec!["c:1"]);

        let (add, del) = backend_diff(&desired, &desired);
        assert!(add.is_empty() && del.is_empty());
    }
}
