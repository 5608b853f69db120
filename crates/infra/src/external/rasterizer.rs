//! HTML to PDF rasterization.
//!
//! A [`Rasterizer`] hands out [`RenderSession`]s. A session owns whatever the
//! backend acquired (browser process, scratch directory) and must be closed
//! by the caller on every path, including render failure and timeout.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::jobs::types::RenderPayload;

/// Rasterizer failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RasterizerError {
    /// Backend could not be started.
    #[error("rasterizer unavailable: {0}")]
    Unavailable(String),
    /// Backend started but failed or crashed mid-render.
    #[error("rasterizer crashed: {0}")]
    Crashed(String),
    /// The document cannot be rendered as given.
    #[error("invalid document: {0}")]
    InvalidInput(String),
    #[error("template not found: {0}")]
    TemplateNotFound(String),
}

#[async_trait]
pub trait Rasterizer: Send + Sync + 'static {
    /// Acquire a session. Nothing needs releasing if this fails.
    async fn open_session(&self) -> Result<Box<dyn RenderSession>, RasterizerError>;
}

#[async_trait]
pub trait RenderSession: Send {
    async fn render(&mut self, payload: &RenderPayload) -> Result<Vec<u8>, RasterizerError>;

    /// Release everything the session holds.
    async fn close(self: Box<Self>);
}

/// Headless Chromium driven through `--print-to-pdf`.
#[derive(Debug, Clone)]
pub struct ChromiumRasterizer {
    binary: PathBuf,
    scratch_root: PathBuf,
    templates_dir: Option<PathBuf>,
}

impl ChromiumRasterizer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            scratch_root: std::env::temp_dir(),
            templates_dir: None,
        }
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    /// Directory of `<template_id>.html` files for template payloads.
    pub fn with_templates_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.templates_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Rasterizer for ChromiumRasterizer {
    async fn open_session(&self) -> Result<Box<dyn RenderSession>, RasterizerError> {
        let dir = self.scratch_root.join(format!("offerdesk-render-{}", Uuid::now_v7()));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RasterizerError::Unavailable(format!("scratch dir: {e}")))?;

        Ok(Box::new(ChromiumSession {
            binary: self.binary.clone(),
            templates_dir: self.templates_dir.clone(),
            dir: Some(dir),
        }))
    }
}

struct ChromiumSession {
    binary: PathBuf,
    templates_dir: Option<PathBuf>,
    /// `None` once released.
    dir: Option<PathBuf>,
}

impl ChromiumSession {
    async fn document(&self, payload: &RenderPayload) -> Result<String, RasterizerError> {
        match payload {
            RenderPayload::Html { html } => Ok(html.clone()),
            RenderPayload::Template { template_id, data } => {
                let dir = self
                    .templates_dir
                    .as_ref()
                    .ok_or_else(|| RasterizerError::TemplateNotFound(template_id.clone()))?;
                if template_id.contains(['/', '\\']) || template_id.starts_with('.') {
                    return Err(RasterizerError::InvalidInput(format!(
                        "template id '{template_id}'"
                    )));
                }
                let source = tokio::fs::read_to_string(dir.join(format!("{template_id}.html")))
                    .await
                    .map_err(|_| RasterizerError::TemplateNotFound(template_id.clone()))?;
                Ok(fill_template(&source, data))
            }
        }
    }
}

#[async_trait]
impl RenderSession for ChromiumSession {
    async fn render(&mut self, payload: &RenderPayload) -> Result<Vec<u8>, RasterizerError> {
        let dir = self
            .dir
            .clone()
            .ok_or_else(|| RasterizerError::Unavailable("session already closed".to_string()))?;
        let html = self.document(payload).await?;

        let input = dir.join("input.html");
        let output = dir.join("output.pdf");
        tokio::fs::write(&input, html)
            .await
            .map_err(|e| RasterizerError::Unavailable(format!("write input: {e}")))?;

        let out = Command::new(&self.binary)
            .arg("--headless")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--no-pdf-header-footer")
            .arg(format!("--print-to-pdf={}", output.display()))
            .arg(file_url(&input))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RasterizerError::Unavailable(format!("spawn {}: {e}", self.binary.display())))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(RasterizerError::Crashed(format!(
                "exit {}: {}",
                out.status,
                stderr.lines().last().unwrap_or_default()
            )));
        }

        tokio::fs::read(&output)
            .await
            .map_err(|e| RasterizerError::Crashed(format!("no output produced: {e}")))
    }

    async fn close(mut self: Box<Self>) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(dir = %dir.display(), error = %e, "failed to remove render scratch dir");
            }
        }
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        // Session dropped without close (task aborted).
        if let Some(dir) = self.dir.take() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Replace `{{key}}` with the matching top-level value of `data`.
fn fill_template(source: &str, data: &serde_json::Value) -> String {
    let mut out = source.to_string();
    if let Some(map) = data.as_object() {
        for (key, value) in map {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&format!("{{{{{key}}}}}"), &text);
        }
    }
    out
}

/// One scripted outcome of [`ScriptedRasterizer`].
#[derive(Debug, Clone)]
pub enum ScriptedRender {
    Pdf(Vec<u8>),
    Fail(RasterizerError),
    /// Sleep before succeeding; used to trip render timeouts.
    Hang(Duration),
    /// Refuse to open a session.
    Unavailable(String),
}

/// Rasterizer that plays back a script and counts sessions.
///
/// Once the script is exhausted every render succeeds.
#[derive(Debug, Default)]
pub struct ScriptedRasterizer {
    script: Mutex<VecDeque<ScriptedRender>>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    rendered: Arc<Mutex<HashMap<String, usize>>>,
}

impl ScriptedRasterizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: impl IntoIterator<Item = ScriptedRender>) -> Self {
        let r = Self::default();
        r.push(script);
        r
    }

    pub fn push(&self, outcomes: impl IntoIterator<Item = ScriptedRender>) {
        if let Ok(mut script) = self.script.lock() {
            script.extend(outcomes);
        }
    }

    pub fn sessions_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of successful renders of a given html body.
    pub fn renders_of(&self, html: &str) -> usize {
        self.rendered
            .lock()
            .ok()
            .and_then(|r| r.get(html).copied())
            .unwrap_or(0)
    }

    fn next(&self) -> Option<ScriptedRender> {
        self.script.lock().ok().and_then(|mut s| s.pop_front())
    }
}

/// Placeholder document produced by scripted successes.
pub const SCRIPTED_PDF: &[u8] = b"%PDF-1.7\n%scripted\n%%EOF\n";

#[async_trait]
impl Rasterizer for ScriptedRasterizer {
    async fn open_session(&self) -> Result<Box<dyn RenderSession>, RasterizerError> {
        let outcome = self.next();
        if let Some(ScriptedRender::Unavailable(msg)) = outcome {
            return Err(RasterizerError::Unavailable(msg));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            outcome,
            closed: self.closed.clone(),
            rendered: self.rendered.clone(),
        }))
    }
}

struct ScriptedSession {
    outcome: Option<ScriptedRender>,
    closed: Arc<AtomicUsize>,
    rendered: Arc<Mutex<HashMap<String, usize>>>,
}

#[async_trait]
impl RenderSession for ScriptedSession {
    async fn render(&mut self, payload: &RenderPayload) -> Result<Vec<u8>, RasterizerError> {
        let bytes = match self.outcome.take() {
            None | Some(ScriptedRender::Unavailable(_)) => SCRIPTED_PDF.to_vec(),
            Some(ScriptedRender::Pdf(bytes)) => bytes,
            Some(ScriptedRender::Fail(err)) => return Err(err),
            Some(ScriptedRender::Hang(d)) => {
                tokio::time::sleep(d).await;
                SCRIPTED_PDF.to_vec()
            }
        };
        debug!(bytes = bytes.len(), "scripted render");
        if let (RenderPayload::Html { html }, Ok(mut rendered)) = (payload, self.rendered.lock()) {
            *rendered.entry(html.clone()).or_insert(0) += 1;
        }
        Ok(bytes)
    }

    async fn close(self: Box<Self>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_template_placeholders() {
        let html = fill_template(
            "<h1>{{title}}</h1><p>{{total}}</p>{{missing}}",
            &serde_json::json!({"title": "Offer 42", "total": 1250}),
        );
        assert_eq!(html, "<h1>Offer 42</h1><p>1250</p>{{missing}}");
    }

    #[tokio::test]
    async fn scripted_rasterizer_counts_sessions() {
        let r = ScriptedRasterizer::with_script([ScriptedRender::Fail(RasterizerError::Crashed(
            "boom".into(),
        ))]);

        let mut s = r.open_session().await.unwrap();
        assert!(s.render(&RenderPayload::html("<p/>")).await.is_err());
        s.close().await;

        let mut s = r.open_session().await.unwrap();
        assert_eq!(s.render(&RenderPayload::html("<p/>")).await.unwrap(), SCRIPTED_PDF);
        s.close().await;

        assert_eq!(r.sessions_opened(), 2);
        assert_eq!(r.sessions_closed(), 2);
        assert_eq!(r.renders_of("<p/>"), 1);
    }

    #[tokio::test]
    async fn chromium_session_removes_scratch_dir_on_close() {
        let root = std::env::temp_dir().join(format!("offerdesk-test-{}", Uuid::now_v7()));
        let r = ChromiumRasterizer::new("/nonexistent/chromium").with_scratch_root(&root);

        let mut s = r.open_session().await.unwrap();
        // Binary is missing, so the render fails after writing its input.
        assert!(matches!(
            s.render(&RenderPayload::html("<p>x</p>")).await,
            Err(RasterizerError::Unavailable(_))
        ));
        s.close().await;

        let mut entries = tokio::fs::read_dir(&root).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn missing_template_is_reported() {
        let r = ChromiumRasterizer::new("chromium");
        let mut s = r.open_session().await.unwrap();
        let err = s
            .render(&RenderPayload::Template {
                template_id: "offer".into(),
                data: serde_json::Value::Null,
            })
            .await
            .unwrap_err();
        assert_eq!(err, RasterizerError::TemplateNotFound("offer".into()));
        s.close().await;
    }
}
