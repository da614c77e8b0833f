//! Campaign scheduler.
//!
//! A campaign is a sequence of experiment items run one after another, each
//! followed by a post-item step (usually a wash). Items carry a global sequence
//! index that continues across phases, and the campaign stops early when the
//! tracked system fluid runs out.
//!
//! # State Machine
//!
//! ```text
//! ┌───────┐  next item   ┌──────────────────┐  fluid <= 0  ┌───────────┐
//! │ Ready │─────────────▶│ check resources  │─────────────▶│ Exhausted │
//! └───────┘              └────────┬─────────┘              └───────────┘
//!     ▲                           │ ok
//!     │                           ▼
//!     │                     ┌─────────┐
//!     └─────────────────────│ Running │  run_item, post, index += 1
//!                           └─────────┘
//!  study drained ──▶ Done (returns next index)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut session = CampaignSession::new(0).with_tracker(Arc::new(resources));
//! let primary = session.run_phase("primary", study, &mut actions).await?;
//! let corrective = session.run_phase("corrective", fixes, &mut actions).await?;
//! println!("next experiment number: {}", session.next_index());
//! ```
//!
//! Studies are pulled one item at a time, so an iterator or stream may compute
//! the next item from the results of the previous one.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tracing::{info, warn};

use lh_core::resources::ResourceTracker;

/// Items that can describe themselves in the campaign log.
pub trait NameTagged {
    /// Short label for the item, if it has one.
    fn name_tag(&self) -> Option<&str> {
        None
    }
}

impl NameTagged for serde_json::Value {
    fn name_tag(&self) -> Option<&str> {
        self.get("name_tag").and_then(serde_json::Value::as_str)
    }
}

impl NameTagged for String {
    fn name_tag(&self) -> Option<&str> {
        Some(self.as_str())
    }
}

impl NameTagged for u32 {}
impl NameTagged for u64 {}

/// What a campaign does with each item.
#[async_trait]
pub trait CampaignActions<T: Send + 'static>: Send {
    /// Run one item. `index` is its global sequence number.
    async fn run_item(&mut self, item: T, index: u64) -> anyhow::Result<()>;

    /// Runs after every item.
    async fn post(&mut self) -> anyhow::Result<()>;
}

/// How a campaign ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CampaignOutcome {
    /// The study was drained.
    Completed {
        /// Index for the next item of a continuing campaign.
        next_index: u64,
    },
    /// The system fluid ran out before an item could start.
    ResourceExhausted {
        /// Index of the item that did not run.
        next_index: u64,
        /// The fluid level that stopped the campaign (mL).
        remaining_ml: f64,
    },
}

impl CampaignOutcome {
    /// Index for the next item of a continuing campaign.
    pub fn next_index(&self) -> u64 {
        match *self {
            CampaignOutcome::Completed { next_index }
            | CampaignOutcome::ResourceExhausted { next_index, .. } => next_index,
        }
    }

    /// Whether the campaign stopped for lack of fluid.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, CampaignOutcome::ResourceExhausted { .. })
    }
}

/// A campaign step failed.
#[derive(Error, Debug)]
pub enum CampaignError {
    /// `run_item` failed.
    #[error("Campaign item {index} '{tag}' failed: {source}")]
    ItemFailed {
        /// Sequence index of the item.
        index: u64,
        /// Tag of the item, empty if it had none.
        tag: String,
        /// What went wrong.
        #[source]
        source: anyhow::Error,
    },

    /// `post` failed.
    #[error("Post-item step after item {index} failed: {source}")]
    PostFailed {
        /// Sequence index of the item just run.
        index: u64,
        /// What went wrong.
        #[source]
        source: anyhow::Error,
    },
}

impl CampaignError {
    /// Sequence index of the item being processed.
    pub fn index(&self) -> u64 {
        match self {
            CampaignError::ItemFailed { index, .. } | CampaignError::PostFailed { index, .. } => {
                *index
            }
        }
    }
}

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignState {
    /// Waiting for the next item.
    Ready,
    /// Running an item or its post step.
    Running,
    /// Stopped for lack of fluid.
    Exhausted,
    /// Study drained.
    Done,
}

impl std::fmt::Display for CampaignState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignState::Ready => write!(f, "ready"),
            CampaignState::Running => write!(f, "running"),
            CampaignState::Exhausted => write!(f, "exhausted"),
            CampaignState::Done => write!(f, "done"),
        }
    }
}

/// Per-invocation bookkeeping shared by the iterator and stream entry points.
struct Cursor<'t> {
    index: u64,
    tracker: Option<&'t dyn ResourceTracker>,
    fluid_ml: Option<f64>,
    state: CampaignState,
    /// Mirrors `index` after every finished item, so an owner sees progress even
    /// when the campaign future is dropped part way.
    progress: Option<&'t mut u64>,
}

impl<'t> Cursor<'t> {
    fn new(start_at: u64, tracker: Option<&'t dyn ResourceTracker>) -> Self {
        Self {
            index: start_at,
            tracker,
            fluid_ml: None,
            state: CampaignState::Ready,
            progress: None,
        }
    }

    fn reporting_to(mut self, progress: &'t mut u64) -> Self {
        *progress = self.index;
        self.progress = Some(progress);
        self
    }

    /// Re-read the fluid level. `Some` means the campaign must stop.
    fn check_resources(&mut self) -> Option<CampaignOutcome> {
        let level = self.tracker?.remaining_system_fluid_ml()?;
        self.fluid_ml = Some(level);
        if level <= 0.0 {
            self.state = CampaignState::Exhausted;
            warn!(
                index = self.index,
                remaining_ml = level,
                state = %self.state,
                "System fluid exhausted, stopping campaign"
            );
            return Some(CampaignOutcome::ResourceExhausted {
                next_index: self.index,
                remaining_ml: level,
            });
        }
        None
    }

    async fn run<T, A>(&mut self, item: T, actions: &mut A) -> Result<(), CampaignError>
    where
        T: NameTagged + Send + 'static,
        A: CampaignActions<T> + ?Sized,
    {
        let index = self.index;
        let tag = item.name_tag().unwrap_or_default().to_string();
        self.state = CampaignState::Running;
        info!(
            index,
            tag = %tag,
            remaining_ml = ?self.fluid_ml,
            at = %chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            "Running campaign item"
        );

        actions
            .run_item(item, index)
            .await
            .map_err(|source| CampaignError::ItemFailed {
                index,
                tag: tag.clone(),
                source,
            })?;
        actions
            .post()
            .await
            .map_err(|source| CampaignError::PostFailed { index, source })?;

        self.index += 1;
        if let Some(progress) = self.progress.as_deref_mut() {
            *progress = self.index;
        }
        self.state = CampaignState::Ready;
        Ok(())
    }

    fn finish(mut self) -> CampaignOutcome {
        self.state = CampaignState::Done;
        info!(next_index = self.index, state = %self.state, "Campaign finished");
        CampaignOutcome::Completed {
            next_index: self.index,
        }
    }
}

/// Run every item of `study` in order, numbering them from `start_at`.
///
/// Before each item the tracker (if any) is re-read; a level at or below zero
/// ends the campaign with [`CampaignOutcome::ResourceExhausted`] and the item is
/// not started. A tracker with no reading does not stop the campaign.
///
/// # Errors
///
/// The first failing `run_item` or `post`. Items after it do not run.
pub async fn run_campaign<T, I, A>(
    study: I,
    actions: &mut A,
    start_at: u64,
    tracker: Option<&dyn ResourceTracker>,
) -> Result<CampaignOutcome, CampaignError>
where
    I: IntoIterator<Item = T>,
    T: NameTagged + Send + 'static,
    A: CampaignActions<T> + ?Sized,
{
    drive(Cursor::new(start_at, tracker), study, actions).await
}

async fn drive<T, I, A>(
    mut cursor: Cursor<'_>,
    study: I,
    actions: &mut A,
) -> Result<CampaignOutcome, CampaignError>
where
    I: IntoIterator<Item = T>,
    T: NameTagged + Send + 'static,
    A: CampaignActions<T> + ?Sized,
{
    for item in study {
        if let Some(exhausted) = cursor.check_resources() {
            return Ok(exhausted);
        }
        cursor.run(item, actions).await?;
    }
    Ok(cursor.finish())
}

/// [`run_campaign`] over an async stream of items.
pub async fn run_campaign_stream<T, S, A>(
    study: S,
    actions: &mut A,
    start_at: u64,
    tracker: Option<&dyn ResourceTracker>,
) -> Result<CampaignOutcome, CampaignError>
where
    S: Stream<Item = T>,
    T: NameTagged + Send + 'static,
    A: CampaignActions<T> + ?Sized,
{
    drive_stream(Cursor::new(start_at, tracker), study, actions).await
}

async fn drive_stream<T, S, A>(
    mut cursor: Cursor<'_>,
    study: S,
    actions: &mut A,
) -> Result<CampaignOutcome, CampaignError>
where
    S: Stream<Item = T>,
    T: NameTagged + Send + 'static,
    A: CampaignActions<T> + ?Sized,
{
    let mut study = std::pin::pin!(study);
    while let Some(item) = study.next().await {
        if let Some(exhausted) = cursor.check_resources() {
            return Ok(exhausted);
        }
        cursor.run(item, actions).await?;
    }
    Ok(cursor.finish())
}

/// A multi-phase campaign sharing one sequence counter and one tracker.
///
/// Once a phase runs out of fluid, later phases return immediately with the same
/// outcome.
#[derive(Clone)]
pub struct CampaignSession {
    next_index: u64,
    tracker: Option<Arc<dyn ResourceTracker>>,
    exhausted: Option<f64>,
}

impl std::fmt::Debug for CampaignSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampaignSession")
            .field("next_index", &self.next_index)
            .field("tracked", &self.tracker.is_some())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl CampaignSession {
    /// A session whose first item gets index `start_at`.
    pub fn new(start_at: u64) -> Self {
        Self {
            next_index: start_at,
            tracker: None,
            exhausted: None,
        }
    }

    /// Stop phases when `tracker` reports no fluid.
    pub fn with_tracker(mut self, tracker: Arc<dyn ResourceTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Index the next item will get.
    ///
    /// Advances as each item's post step finishes, so after an interrupted phase
    /// it names the first item that did not complete.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Whether a phase has run out of fluid.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.is_some()
    }

    fn skipped(&self, phase: &str) -> Option<CampaignOutcome> {
        let remaining_ml = self.exhausted?;
        warn!(phase, "Skipping phase, system fluid already exhausted");
        Some(CampaignOutcome::ResourceExhausted {
            next_index: self.next_index,
            remaining_ml,
        })
    }

    fn record(&mut self, outcome: CampaignOutcome) -> CampaignOutcome {
        self.next_index = outcome.next_index();
        if let CampaignOutcome::ResourceExhausted { remaining_ml, .. } = outcome {
            self.exhausted = Some(remaining_ml);
        }
        outcome
    }

    /// Run one phase, continuing the sequence numbering.
    ///
    /// On error the counter is left at the failed item, so a retry reuses its
    /// index.
    pub async fn run_phase<T, I, A>(
        &mut self,
        phase: &str,
        study: I,
        actions: &mut A,
    ) -> Result<CampaignOutcome, CampaignError>
    where
        I: IntoIterator<Item = T>,
        T: NameTagged + Send + 'static,
        A: CampaignActions<T> + ?Sized,
    {
        if let Some(outcome) = self.skipped(phase) {
            return Ok(outcome);
        }
        info!(phase, start_at = self.next_index, "Starting campaign phase");
        let cursor = Cursor::new(self.next_index, self.tracker.as_deref())
            .reporting_to(&mut self.next_index);
        let result = drive(cursor, study, actions).await;
        self.settle(result)
    }

    /// [`run_phase`](Self::run_phase) over an async stream.
    pub async fn run_phase_stream<T, S, A>(
        &mut self,
        phase: &str,
        study: S,
        actions: &mut A,
    ) -> Result<CampaignOutcome, CampaignError>
    where
        S: Stream<Item = T>,
        T: NameTagged + Send + 'static,
        A: CampaignActions<T> + ?Sized,
    {
        if let Some(outcome) = self.skipped(phase) {
            return Ok(outcome);
        }
        info!(phase, start_at = self.next_index, "Starting campaign phase");
        let cursor = Cursor::new(self.next_index, self.tracker.as_deref())
            .reporting_to(&mut self.next_index);
        let result = drive_stream(cursor, study, actions).await;
        self.settle(result)
    }

    fn settle(
        &mut self,
        result: Result<CampaignOutcome, CampaignError>,
    ) -> Result<CampaignOutcome, CampaignError> {
        match result {
            Ok(outcome) => Ok(self.record(outcome)),
            Err(e) => {
                self.next_index = e.index();
                Err(e)
            }
        }
    }
}
