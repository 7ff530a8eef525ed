//! Sandbox endpoint resolution.
//!
//! The platform that spawns containers knows where each sandbox lives; the
//! edge only consumes that mapping through [`SandboxResolver`]. The shipped
//! [`TemplateResolver`] covers single-host and DNS-addressed deployments,
//! where the control-plane origin is a function of the sandbox id.

use {async_trait::async_trait, url::Url};

#[async_trait]
pub trait SandboxResolver: Send + Sync {
    /// Resolve a sanitized sandbox id to its control-plane origin, or `None`
    /// for unknown sandboxes.
    async fn resolve(&self, sandbox_id: &str) -> anyhow::Result<Option<Url>>;
}

/// Resolves by substituting `{id}` into a URL template, e.g.
/// `http://{id}.sandboxes.internal:3000` or `http://127.0.0.1:3000` for
/// single-sandbox development.
pub struct TemplateResolver {
    template: String,
}

impl TemplateResolver {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl SandboxResolver for TemplateResolver {
    async fn resolve(&self, sandbox_id: &str) -> anyhow::Result<Option<Url>> {
        let raw = self.template.replace("{id}", sandbox_id);
        let url = Url::parse(&raw)
            .map_err(|e| anyhow::anyhow!("bad sandbox origin template '{raw}': {e}"))?;
        Ok(Some(url))
    }
}
