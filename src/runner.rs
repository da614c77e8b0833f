//! Glue between the campaign scheduler and the pipetting engine.
//!
//! A study file is a JSON array of [`StudyItem`]s. Each item's operations run
//! through the engine; between items the needle is cleaned at waste (and washed
//! externally when a wash vial is configured).

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use lh_core::capabilities::PipettingBackend;
use lh_core::deck::Placeable;
use lh_experiment::{CampaignActions, NameTagged};
use lh_pipetting::operations::{InternalCleanSpec, PipettingOperation, TipExitMethod};
use lh_pipetting::PipettingEngine;

/// One experiment of a study file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudyItem {
    /// Label shown in the campaign log.
    #[serde(default)]
    pub name_tag: Option<String>,
    /// Operations to run; `null` entries are skipped.
    #[serde(default)]
    pub operations: Vec<Option<PipettingOperation>>,
}

impl NameTagged for StudyItem {
    fn name_tag(&self) -> Option<&str> {
        self.name_tag.as_deref()
    }
}

/// Read a study file.
pub fn load_study(path: &Path) -> anyhow::Result<Vec<StudyItem>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading study {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing study {}", path.display()))
}

/// Runs study items on a pipetting engine.
#[derive(Debug)]
pub struct PipettingCampaign<B: PipettingBackend> {
    engine: PipettingEngine<B>,
    waste: Placeable,
    wash: Option<Placeable>,
    clean_volume_ul: f64,
}

impl<B: PipettingBackend> PipettingCampaign<B> {
    /// Clean at `waste` after every item, flushing `clean_volume_ul` per cycle.
    pub fn new(engine: PipettingEngine<B>, waste: Placeable, clean_volume_ul: f64) -> Self {
        Self {
            engine,
            waste,
            wash: None,
            clean_volume_ul,
        }
    }

    /// Also wash the needle outside in `wash` between items.
    pub fn with_wash(mut self, wash: Option<Placeable>) -> Self {
        self.wash = wash;
        self
    }

    /// The engine.
    pub fn engine(&self) -> &PipettingEngine<B> {
        &self.engine
    }

    /// The engine, mutably (for clean-up after an interrupted run).
    pub fn engine_mut(&mut self) -> &mut PipettingEngine<B> {
        &mut self.engine
    }

    /// Give the engine back.
    pub fn into_engine(self) -> PipettingEngine<B> {
        self.engine
    }
}

#[async_trait]
impl<B: PipettingBackend> CampaignActions<StudyItem> for PipettingCampaign<B> {
    #[instrument(skip(self, item), fields(tag = item.name_tag.as_deref().unwrap_or("")))]
    async fn run_item(&mut self, item: StudyItem, index: u64) -> anyhow::Result<()> {
        info!(index, operations = item.operations.len(), "Running study item");
        self.engine.chain(item.operations).await?;
        Ok(())
    }

    async fn post(&mut self) -> anyhow::Result<()> {
        match &self.wash {
            Some(wash) => {
                self.engine
                    .inter_clean(&self.waste, wash, self.clean_volume_ul)
                    .await?
            }
            None => {
                let mut clean = InternalCleanSpec::new(self.clean_volume_ul, self.waste.clone());
                clean.free_dispense = true;
                clean.tip_exit = TipExitMethod::TipTouch;
                self.engine.internal_clean(&clean).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn study_items_parse_with_defaults() {
        let items: Vec<StudyItem> = serde_json::from_str(
            r#"[
                {"name_tag": "blank", "operations": [{"op": "comment", "message": "hi"}, null]},
                {}
            ]"#,
        )
        .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name_tag(), Some("blank"));
        assert_eq!(items[0].operations.len(), 2);
        assert!(items[0].operations[1].is_none());
        assert_eq!(items[1].name_tag(), None);
        assert!(items[1].operations.is_empty());
    }
}
