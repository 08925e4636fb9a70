//! CLI command handlers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::capability::{HttpProvider, RequirementProvider};
use crate::config::WorkflowConfig;
use crate::workflow::types::{EventKind, SourceDocument, WorkflowRequest};
use crate::workflow::WorkflowOrchestrator;

fn build_provider(api_base: String, api_key: Option<String>) -> HttpProvider {
    let mut provider = HttpProvider::new(api_base);
    if let Some(key) = api_key {
        provider = provider.with_api_key(key);
    }
    provider
}

/// Submits one document through the workflow and streams its events to
/// stdout as JSON lines. Exits with an error if the run fails.
pub async fn run(
    document: PathBuf,
    correlation_id: Option<String>,
    api_base: String,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&document)
        .with_context(|| format!("failed to read document {}", document.display()))?;
    let doc_id = document
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document")
        .to_string();

    let provider = Arc::new(build_provider(api_base, api_key));
    let config = WorkflowConfig::from_env()?;
    let orchestrator = WorkflowOrchestrator::new(config, provider)?;

    let correlation_id =
        correlation_id.unwrap_or_else(|| format!("run-{}", Uuid::new_v4().simple()));
    let mut events = orchestrator.subscribe(&correlation_id);

    orchestrator.submit(WorkflowRequest::with_documents(
        correlation_id.clone(),
        vec![SourceDocument::new(doc_id, content)],
    ))?;

    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event)?);
        if event.kind == EventKind::WorkflowResult {
            let failed = event.payload.get("phase").and_then(|p| p.as_str()) == Some("failed");
            if failed {
                let reason = event
                    .payload
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .unwrap_or("unknown");
                anyhow::bail!("workflow '{}' failed: {}", correlation_id, reason);
            }
            break;
        }
    }

    Ok(())
}

/// One-shot evaluation call against the capability API.
pub async fn evaluate(
    text: String,
    api_base: String,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    let provider = build_provider(api_base, api_key);
    let evaluation = provider.evaluate(&text).await?;
    println!("{}", serde_json::to_string_pretty(&evaluation)?);
    Ok(())
}
