//! Template rendering stage.
//!
//! Substitutes projected record variables into the configured template
//! body. Placeholders look like `{{name}}`; every placeholder must have a
//! value — a missing one is an invocation error, not an empty string.

use async_trait::async_trait;
use regex::{Captures, Regex};

use crate::config::TemplaterConfig;
use crate::error::StageError;
use crate::pipeline::types::TemplateVars;
use crate::stages::Renderer;

const STAGE_NAME: &str = "templater";

/// Renders records through a `{{placeholder}}` template.
pub struct TemplateRenderer {
    template: String,
    placeholder: Regex,
}

impl TemplateRenderer {
    pub fn new(config: TemplaterConfig) -> Self {
        Self {
            template: config.template,
            placeholder: Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap(),
        }
    }
}

#[async_trait]
impl Renderer for TemplateRenderer {
    fn name(&self) -> &str {
        STAGE_NAME
    }

    async fn render(&self, vars: &TemplateVars) -> Result<String, StageError> {
        let mut missing: Option<String> = None;

        let rendered = self
            .placeholder
            .replace_all(&self.template, |caps: &Captures<'_>| {
                let name = &caps[1];
                match vars.get(name) {
                    Some(value) => value.clone(),
                    None => {
                        if missing.is_none() {
                            missing = Some(name.to_string());
                        }
                        String::new()
                    }
                }
            })
            .into_owned();

        if let Some(name) = missing {
            return Err(StageError::InvalidInput {
                stage: STAGE_NAME.into(),
                reason: format!("template variable '{name}' has no value"),
            });
        }

        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer(template: &str) -> TemplateRenderer {
        TemplateRenderer::new(TemplaterConfig {
            template: template.to_string(),
            variables: Vec::new(),
        })
    }

    fn vars(pairs: &[(&str, &str)]) -> TemplateVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn substitutes_placeholders() {
        let r = renderer(r#"{"sku": "{{sku}}", "qty": {{qty}}}"#);
        let out = r
            .render(&vars(&[("sku", "A-1"), ("qty", "3")]))
            .await
            .unwrap();
        assert_eq!(out, r#"{"sku": "A-1", "qty": 3}"#);
    }

    #[tokio::test]
    async fn repeated_placeholder_substituted_each_time() {
        let r = renderer("{{name}} and {{name}} again");
        let out = r.render(&vars(&[("name", "Ada")])).await.unwrap();
        assert_eq!(out, "Ada and Ada again");
    }

    #[tokio::test]
    async fn whitespace_inside_braces_is_allowed() {
        let r = renderer("{{ sku }}/{{sku}}");
        let out = r.render(&vars(&[("sku", "A-1")])).await.unwrap();
        assert_eq!(out, "A-1/A-1");
    }

    #[tokio::test]
    async fn missing_variable_is_an_error() {
        let r = renderer("{{sku}} x{{qty}}");
        let err = r.render(&vars(&[("sku", "A-1")])).await.unwrap_err();
        match err {
            StageError::InvalidInput { reason, .. } => assert!(reason.contains("'qty'")),
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn template_without_placeholders_passes_through() {
        let r = renderer("static body");
        let out = r.render(&TemplateVars::new()).await.unwrap();
        assert_eq!(out, "static body");
    }

    #[tokio::test]
    async fn unused_variables_are_fine() {
        let r = renderer("{{sku}}");
        let out = r
            .render(&vars(&[("sku", "A-1"), ("extra", "ignored")]))
            .await
            .unwrap();
        assert_eq!(out, "A-1");
    }
}
