// ABOUTME: CLI request command - submit requests through one pool registry and stream results
//
// Response heads go to stderr (text or JSON), bodies stream to stdout.
// Exits with an error if any copy of the request ended in failure.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{OutputFormat, RequestArgs};
use crate::config::PoolConfig;
use crate::destination::{ServiceDirectory, ServiceEndpoint};
use crate::pool::ConnectionPoolRegistry;
use crate::request::{HttpsRequest, RequestDispatcher, RequestEvent, ResponseHead, SubmittedRequest};
use crate::transport::ReqwestConnector;

/// Execute the request command
pub async fn execute(args: RequestArgs, mut config: PoolConfig, format: OutputFormat) -> Result<()> {
    if args.repeat == 0 {
        bail!("--repeat must be at least 1");
    }
    if let Some(pool_size) = args.pool_size {
        config.pool_size = pool_size;
    }
    config.validate()?;

    let services = Arc::new(ServiceDirectory::new(config.max_services));
    for (name, endpoint) in &config.services {
        services.upsert(name, endpoint.clone())?;
    }
    for raw in &args.services {
        let (name, endpoint) = parse_service_arg(raw)?;
        services.upsert(&name, endpoint)?;
    }

    let registry = Arc::new(ConnectionPoolRegistry::new(
        ReqwestConnector::new(&config),
        &config,
    ));
    let dispatcher = RequestDispatcher::new(Arc::clone(&registry), services, &config);

    let mut handles = Vec::with_capacity(args.repeat);
    for _ in 0..args.repeat {
        let submitted = dispatcher
            .submit(build_request(&args))
            .context("Failed to submit request")?;
        debug!(token = %submitted.token, "Submitted");
        handles.push(tokio::spawn(drive_output(submitted, args.data.clone(), format)));
    }

    let mut failures = 0;
    for handle in handles {
        match handle.await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => failures += 1,
            Ok(Err(e)) => {
                eprintln!("error: {e:#}");
                failures += 1;
            }
            Err(e) => {
                eprintln!("error: request task failed: {e}");
                failures += 1;
            }
        }
    }

    let metrics = registry.metrics_snapshot();
    info!(?metrics, destinations = ?registry.destinations(), "Requests complete");
    registry.shutdown();

    if failures > 0 {
        bail!("{failures} of {} requests failed", args.repeat);
    }
    Ok(())
}

/// Parse `name=host:port`
pub fn parse_service_arg(raw: &str) -> Result<(String, ServiceEndpoint)> {
    let (name, endpoint) = raw
        .split_once('=')
        .with_context(|| format!("Invalid service '{raw}', expected name=host:port"))?;
    if name.is_empty() {
        bail!("Invalid service '{raw}': empty name");
    }
    let endpoint: ServiceEndpoint = endpoint.parse()?;
    Ok((name.to_string(), endpoint))
}

fn build_request(args: &RequestArgs) -> HttpsRequest {
    let mut request = HttpsRequest::new(args.target.as_str()).method(args.method.as_str());
    if let Some(path) = &args.path {
        request = request.path(path.as_str());
    }
    for header in &args.headers {
        request = request.header(header.as_str());
    }
    if args.data.is_some() {
        request = request.with_body();
    }
    request
}

#[derive(Serialize)]
struct HeadOutput<'a> {
    token: String,
    #[serde(flatten)]
    head: &'a ResponseHead,
}

/// Write the body (if any), then print events until the terminal one; true on 2xx
async fn drive_output(
    mut submitted: SubmittedRequest,
    data: Option<String>,
    format: OutputFormat,
) -> Result<bool> {
    if let (Some(mut writer), Some(data)) = (submitted.body.take(), data) {
        writer.write(data).await?;
        writer.end();
    }

    let mut stdout = tokio::io::stdout();
    let mut success = false;
    while let Some(event) = submitted.events.recv().await {
        match event {
            RequestEvent::Ready { token } => debug!(%token, "Client ready"),
            RequestEvent::Headers { token, head } => {
                print_head(&token.to_string(), &head, format)?;
                success = (200..300).contains(&head.code);
            }
            RequestEvent::Body {
                chunk: Some(chunk), ..
            } => stdout.write_all(&chunk).await?,
            RequestEvent::Body { chunk: None, .. } => {
                stdout.flush().await?;
                return Ok(success);
            }
            RequestEvent::Failed { error, .. } => return Err(error.into()),
        }
    }
    Ok(success)
}

fn print_head(token: &str, head: &ResponseHead, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let line = serde_json::to_string(&HeadOutput {
                token: token.to_string(),
                head,
            })?;
            eprintln!("{line}");
        }
        OutputFormat::Text => {
            eprintln!("[{token}] {} {}", head.code, head.status_text);
            for (name, value) in head.headers.fields() {
                eprintln!("  {name}: {value}");
            }
            for cookie in head.headers.set_cookies() {
                eprintln!("  Set-Cookie: {cookie}");
            }
        }
    }
    Ok(())
}
