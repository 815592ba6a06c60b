//! Content planning: turning a script into per-asset generation specs.
//!
//! The orchestrator calls a [`ContentPlanner`] exactly once per job and
//! forwards the resulting specs to the backend untouched. [`ScriptPlanner`]
//! is the built-in deterministic planner.

use async_trait::async_trait;

use crate::error::PlanError;
use crate::scheduler::job::{AssetParams, AssetSpec, AssetType};

/// Produces one generation spec per requested asset.
#[async_trait]
pub trait ContentPlanner: Send + Sync {
    /// Plans `num_assets` specs for `script`, in asset order.
    async fn plan(
        &self,
        script: &str,
        asset_types: &[AssetType],
        num_assets: u32,
    ) -> Result<Vec<AssetSpec>, PlanError>;
}

/// Splits a script into segments and assigns them to assets round-robin.
///
/// Segments are paragraphs (blank-line separated). A single-paragraph
/// script is split into sentences instead. Asset types cycle in the order
/// requested, so `[image, audio]` over four assets yields image, audio,
/// image, audio.
#[derive(Debug, Clone, Default)]
pub struct ScriptPlanner {
    /// Optional style hint appended to image prompts.
    style: Option<String>,
}

impl ScriptPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    fn segments(script: &str) -> Vec<String> {
        let paragraphs: Vec<String> = script
            .split("\n\n")
            .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|p| !p.is_empty())
            .collect();
        if paragraphs.len() > 1 {
            return paragraphs;
        }

        script
            .split_inclusive(['.', '!', '?'])
            .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|s| s.chars().any(char::is_alphanumeric))
            .collect()
    }

    fn params_for(&self, asset_type: AssetType) -> AssetParams {
        match (asset_type, &self.style) {
            (AssetType::Image, Some(style)) => AssetParams::Image {
                width: 1024,
                height: 1024,
                style: Some(style.clone()),
            },
            (other, _) => AssetParams::default_for(other),
        }
    }
}

#[async_trait]
impl ContentPlanner for ScriptPlanner {
    async fn plan(
        &self,
        script: &str,
        asset_types: &[AssetType],
        num_assets: u32,
    ) -> Result<Vec<AssetSpec>, PlanError> {
        if asset_types.is_empty() {
            return Err(PlanError::Failed("no asset types to plan".to_string()));
        }
        let segments = Self::segments(script);
        if segments.is_empty() {
            return Err(PlanError::NoSegments);
        }

        let specs = (0..num_assets)
            .map(|index| {
                let i = index as usize;
                let asset_type = asset_types[i % asset_types.len()];
                let segment = &segments[i % segments.len()];
                let prompt = match asset_type {
                    AssetType::Image => format!("Illustration: {}", segment),
                    AssetType::Video => format!("Short clip: {}", segment),
                    AssetType::Audio => format!("Narration: {}", segment),
                };
                AssetSpec::new(index, prompt, self.params_for(asset_type))
            })
            .collect();

        tracing::debug!(
            segments = segments.len(),
            num_assets = num_assets,
            "Planned asset specs from script"
        );
        Ok(specs)
    }
}
