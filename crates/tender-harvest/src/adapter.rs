//! Extraction adapters: one implementation per page-layout family.
//!
//! The orchestrator knows nothing about page layouts. It looks up an
//! [`ExtractionAdapter`] by the target's `layout` in an [`AdapterRegistry`]
//! and calls it once per unit attempt, inside the worker's exclusive view.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::TargetConfig;
use crate::error::{AdapterError, HarvestError, HarvestResult};
use crate::renderer::RenderContext;
use crate::types::{RawRecord, WorkUnit};

/// Layout heuristics for one family of sites.
#[async_trait]
pub trait ExtractionAdapter: Send + Sync {
    /// Layout family name this adapter serves.
    fn family(&self) -> &str;

    /// Extract every row listed for `unit`.
    async fn extract(
        &self,
        unit: &WorkUnit,
        ctx: &mut dyn RenderContext,
    ) -> Result<Vec<RawRecord>, AdapterError>;

    /// Number of rows listed for `unit`, if the layout can tell without a
    /// full extraction. `None` means "extract and count".
    async fn count(
        &self,
        _unit: &WorkUnit,
        _ctx: &mut dyn RenderContext,
    ) -> Result<Option<usize>, AdapterError> {
        Ok(None)
    }
}

type AdapterBuilder =
    Box<dyn Fn(&TargetConfig) -> HarvestResult<Arc<dyn ExtractionAdapter>> + Send + Sync>;

/// Adapters by layout family.
pub struct AdapterRegistry {
    builders: HashMap<String, AdapterBuilder>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registry with the built-in `script` family.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(ScriptAdapter::FAMILY, |target| {
            Ok(Arc::new(ScriptAdapter::from_target(target)?) as Arc<dyn ExtractionAdapter>)
        });
        registry
    }

    /// Register a builder that configures an adapter from the target.
    pub fn register<F>(&mut self, family: &str, builder: F)
    where
        F: Fn(&TargetConfig) -> HarvestResult<Arc<dyn ExtractionAdapter>> + Send + Sync + 'static,
    {
        self.builders.insert(family.to_string(), Box::new(builder));
    }

    /// Register a ready adapter under its own family name.
    pub fn register_adapter(&mut self, adapter: Arc<dyn ExtractionAdapter>) {
        let family = adapter.family().to_string();
        self.register(&family, move |_| Ok(adapter.clone()));
    }

    pub fn families(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.keys().cloned().collect();
        names.sort();
        names
    }

    /// Adapter for `target.layout`.
    pub fn build(&self, target: &TargetConfig) -> HarvestResult<Arc<dyn ExtractionAdapter>> {
        let builder = self
            .builders
            .get(&target.layout)
            .ok_or_else(|| HarvestError::UnknownLayout(target.layout.clone()))?;
        builder(target)
    }
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_closing_date_field() -> String {
    "closing_date".to_string()
}

fn default_navigation_timeout_ms() -> u64 {
    30_000
}

/// Options of the `script` family, read from `TargetConfig::options`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptOptions {
    /// Expression evaluated in the page; must yield an array of row objects.
    pub script: String,
    /// Expression yielding the number of listed rows.
    #[serde(default)]
    pub count_script: Option<String>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_closing_date_field")]
    pub closing_date_field: String,
    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,
}

/// Generic adapter: open the unit's URL and evaluate a configured script.
#[derive(Debug, Clone)]
pub struct ScriptAdapter {
    options: ScriptOptions,
}

impl ScriptAdapter {
    pub const FAMILY: &'static str = "script";

    pub fn new(options: ScriptOptions) -> Self {
        Self { options }
    }

    pub fn from_target(target: &TargetConfig) -> HarvestResult<Self> {
        let options: ScriptOptions = serde_json::from_value(target.options.clone()).map_err(|e| {
            HarvestError::InvalidConfig(format!("script options of {:?}: {e}", target.name))
        })?;
        Ok(Self::new(options))
    }

    async fn open(&self, unit: &WorkUnit, ctx: &mut dyn RenderContext) -> Result<(), AdapterError> {
        let url = unit
            .url
            .as_deref()
            .ok_or_else(|| AdapterError::DeadEnd(format!("unit {:?} has no url", unit.name)))?;
        ctx.navigate(url, self.options.navigation_timeout_ms)
            .await
            .map_err(|e| AdapterError::Navigation(format!("{url}: {e}")))?;
        Ok(())
    }

    fn rows_from(&self, value: serde_json::Value) -> Result<Vec<RawRecord>, AdapterError> {
        let serde_json::Value::Array(rows) = value else {
            return Err(AdapterError::Malformed(format!(
                "script returned {}, expected an array",
                kind_of(&value)
            )));
        };

        let mut out = Vec::with_capacity(rows.len());
        for (i, row) in rows.into_iter().enumerate() {
            let serde_json::Value::Object(map) = row else {
                return Err(AdapterError::Malformed(format!("row {i} is not an object")));
            };
            let mut record = RawRecord::default();
            for (key, value) in map {
                let text = value_text(&value);
                if key == self.options.id_field {
                    record.id_text = text;
                } else if key == self.options.closing_date_field {
                    record.closing_date_text = text;
                } else if !value.is_null() {
                    record.fields.insert(key, text);
                }
            }
            out.push(record);
        }
        Ok(out)
    }
}

#[async_trait]
impl ExtractionAdapter for ScriptAdapter {
    fn family(&self) -> &str {
        Self::FAMILY
    }

    async fn extract(
        &self,
        unit: &WorkUnit,
        ctx: &mut dyn RenderContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        self.open(unit, ctx).await?;
        let value = ctx.execute_js(&self.options.script).await?;
        self.rows_from(value)
    }

    async fn count(
        &self,
        unit: &WorkUnit,
        ctx: &mut dyn RenderContext,
    ) -> Result<Option<usize>, AdapterError> {
        let Some(script) = &self.options.count_script else {
            return Ok(None);
        };
        self.open(unit, ctx).await?;
        let value = ctx.execute_js(script).await?;
        value
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| AdapterError::Malformed(format!("count script returned {value}")))
    }
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn kind_of(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
