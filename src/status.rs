//! `routeplane status`: ask a running node for `/cluster/status` and print it.

use std::{fmt::Write as _, time::Duration};

use anyhow::Context;
use serde_json::{Map, Value};

pub async fn fetch_cluster_status(base_url: &str) -> anyhow::Result<Map<String, Value>> {
    let url = format!("{}/cluster/status", base_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("build http client")?;
    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()
        .with_context(|| format!("GET {url}"))?;
    let value = resp
        .json::<Value>()
        .await
        .with_context(|| format!("decode response from {url}"))?;
    match value {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("expected a JSON object from {url}, got {other}"),
    }
}

fn field(status: &Map<String, Value>, key: &str) -> String {
    match status.get(key) {
        None | Some(Value::Null) => "-".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// One `key: value` line per field of interest, then one line per peer.
pub fn render_summary(status: &Map<String, Value>) -> String {
    let mut out = String::new();
    for key in [
        "node_id",
        "state",
        "term",
        "current_leader",
        "last_log_index",
        "applied_index",
        "snapshot_index",
        "purged_index",
        "voters",
        "learners",
        "routes",
    ] {
        let _ = writeln!(out, "{key:<15} {}", field(status, key));
    }

    let matched = status.get("replication").and_then(Value::as_object);
    if let Some(peers) = status.get("peers").and_then(Value::as_array) {
        for peer in peers {
            let id = peer.get("id").map(Value::to_string).unwrap_or_default();
            let url = peer
                .get("api_base_url")
                .and_then(Value::as_str)
                .unwrap_or("-");
            let progress = matched
                .and_then(|m| m.get(&id))
                .filter(|v| !v.is_null())
                .map(|v| format!(" matched={v}"))
                .unwrap_or_default();
            let _ = writeln!(out, "peer {id:<10} {url}{progress}");
        }
    }
    out
}

pub async fn run(url: &str, json: bool) -> anyhow::Result<()> {
    let status = fetch_cluster_status(url).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", render_summary(&status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    fn sample() -> Value {
        json!({
            "node_id": 1,
            "state": "Leader",
            "term": 4,
            "current_leader": 1,
            "last_log_index": 17,
            "applied_index": 17,
            "snapshot_index": null,
            "purged_index": null,
            "voters": [1, 2],
            "learners": [],
            "peers": [{"id": 2, "name": "node-2", "api_base_url": "http://10.0.0.2:9090"}],
            "replication": {"1": 17, "2": 16},
            "routes": 3
        })
    }

    #[test]
    fn summary_lists_fields_and_peers() {
        let Value::Object(status) = sample() else {
            unreachable!()
        };
        let out = render_summary(&status);
        assert!(out.contains("state           Leader\n"), "{out}");
        assert!(out.contains("snapshot_index  -\n"), "{out}");
        assert!(out.contains("voters          [1,2]\n"), "{out}");
        assert!(
            out.contains("peer 2          http://10.0.0.2:9090 matched=16\n"),
            "{out}"
        );
    }

    #[tokio::test]
    async fn fetches_status_from_node() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cluster/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample()))
            .expect(1)
            .mount(&server)
            .await;

        let status = fetch_cluster_status(&format!("{}/", server.uri()))
            .await
            .unwrap();
        assert_eq!(status["term"], json!(4));
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cluster/status"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = fetch_cluster_status(&server.uri()).await.unwrap_err();
        assert!(format!("{err:#}").contains("500"), "{err:#}");
    }
}
