//! Scheduler behaviour with scripted actions and trackers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use lh_core::resources::{ResourceConfig, ResourceTracker, SYSTEM_FLUID_KEY};
use lh_experiment::{
    run_campaign, run_campaign_stream, CampaignActions, CampaignError, CampaignOutcome,
    CampaignSession,
};

/// Records what ran, in order.
#[derive(Default)]
struct Log {
    events: Vec<String>,
    fail_on: Option<u64>,
    fail_post_on: Option<u64>,
    last: Option<u64>,
}

#[async_trait]
impl CampaignActions<Value> for Log {
    async fn run_item(&mut self, item: Value, index: u64) -> anyhow::Result<()> {
        self.last = Some(index);
        if self.fail_on == Some(index) {
            anyhow::bail!("pump stalled");
        }
        let tag = item["name_tag"].as_str().unwrap_or("-").to_string();
        self.events.push(format!("run {index} {tag}"));
        Ok(())
    }

    async fn post(&mut self) -> anyhow::Result<()> {
        if self.fail_post_on.is_some() && self.fail_post_on == self.last {
            anyhow::bail!("wash vial missing");
        }
        self.events.push("post".into());
        Ok(())
    }
}

fn study(tags: &[&str]) -> Vec<Value> {
    tags.iter().map(|t| json!({ "name_tag": t })).collect()
}

/// Hands out a scripted sequence of levels, repeating the last one.
struct Scripted(Mutex<VecDeque<Option<f64>>>);

impl Scripted {
    fn new(levels: &[Option<f64>]) -> Self {
        Self(Mutex::new(levels.iter().copied().collect()))
    }
}

impl ResourceTracker for Scripted {
    fn remaining_system_fluid_ml(&self) -> Option<f64> {
        let mut levels = self.0.lock().unwrap();
        if levels.len() > 1 {
            levels.pop_front().flatten()
        } else {
            levels.front().copied().flatten()
        }
    }
}

#[tokio::test]
async fn items_are_numbered_from_the_start_index() {
    let mut log = Log::default();
    let outcome = run_campaign(study(&["a", "b", "c"]), &mut log, 5, None)
        .await
        .unwrap();
    assert_eq!(outcome, CampaignOutcome::Completed { next_index: 8 });
    assert_eq!(
        log.events,
        vec!["run 5 a", "post", "run 6 b", "post", "run 7 c", "post"]
    );
}

#[tokio::test]
async fn empty_study_returns_the_start_index() {
    let mut log = Log::default();
    let outcome = run_campaign(Vec::<Value>::new(), &mut log, 12, None)
        .await
        .unwrap();
    assert_eq!(outcome.next_index(), 12);
    assert!(log.events.is_empty());
}

#[tokio::test]
async fn split_studies_number_like_one_study() {
    let mut whole = Log::default();
    let all = run_campaign(study(&["a", "b", "c", "d"]), &mut whole, 0, None)
        .await
        .unwrap();

    let mut split = Log::default();
    let first = run_campaign(study(&["a", "b"]), &mut split, 0, None)
        .await
        .unwrap();
    let second = run_campaign(study(&["c", "d"]), &mut split, first.next_index(), None)
        .await
        .unwrap();

    assert_eq!(all.next_index(), second.next_index());
    assert_eq!(whole.events, split.events);
}

#[tokio::test]
async fn exhausted_fluid_stops_before_the_item() {
    let tracker = Scripted::new(&[Some(3.0), Some(0.4), Some(0.0)]);
    let mut log = Log::default();
    let outcome = run_campaign(study(&["a", "b", "c", "d"]), &mut log, 0, Some(&tracker))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CampaignOutcome::ResourceExhausted {
            next_index: 2,
            remaining_ml: 0.0
        }
    );
    assert_eq!(log.events, vec!["run 0 a", "post", "run 1 b", "post"]);
}

#[tokio::test]
async fn unknown_fluid_level_does_not_stop() {
    let tracker = Scripted::new(&[None]);
    let mut log = Log::default();
    let outcome = run_campaign(study(&["a", "b"]), &mut log, 0, Some(&tracker))
        .await
        .unwrap();
    assert_eq!(outcome, CampaignOutcome::Completed { next_index: 2 });
}

#[tokio::test]
async fn failures_carry_index_and_tag() {
    let mut log = Log {
        fail_on: Some(11),
        ..Log::default()
    };
    let err = run_campaign(study(&["a", "b", "c"]), &mut log, 10, None)
        .await
        .unwrap_err();
    match &err {
        CampaignError::ItemFailed { index, tag, source } => {
            assert_eq!(*index, 11);
            assert_eq!(tag, "b");
            assert_eq!(source.to_string(), "pump stalled");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(log.events, vec!["run 10 a", "post"]);

    let mut log = Log {
        fail_post_on: Some(10),
        ..Log::default()
    };
    let err = run_campaign(study(&["a", "b"]), &mut log, 10, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CampaignError::PostFailed { index: 10, .. }));
}

#[tokio::test]
async fn items_without_a_tag_still_run() {
    let mut log = Log::default();
    let items = vec![json!({"volume": 10}), json!(42)];
    let outcome = run_campaign(items, &mut log, 0, None).await.unwrap();
    assert_eq!(outcome.next_index(), 2);
    assert_eq!(log.events, vec!["run 0 -", "post", "run 1 -", "post"]);
}

#[tokio::test]
async fn session_skips_phases_after_exhaustion() {
    let tracker = Arc::new(Scripted::new(&[Some(5.0), Some(-1.0)]));
    let mut session = CampaignSession::new(3).with_tracker(tracker);
    let mut log = Log::default();

    let first = session
        .run_phase("primary", study(&["a", "b"]), &mut log)
        .await
        .unwrap();
    assert!(first.is_exhausted());
    assert_eq!(first.next_index(), 4);

    let second = session
        .run_phase("corrective", study(&["c"]), &mut log)
        .await
        .unwrap();
    assert!(second.is_exhausted());
    assert!(session.is_exhausted());
    assert_eq!(session.next_index(), 4);
    assert_eq!(log.events, vec!["run 3 a", "post"]);
}

#[tokio::test]
async fn session_counter_stays_on_a_failed_item() {
    let mut session = CampaignSession::new(0);
    let mut log = Log {
        fail_on: Some(1),
        ..Log::default()
    };
    assert!(session
        .run_phase("primary", study(&["a", "b", "c"]), &mut log)
        .await
        .is_err());
    assert_eq!(session.next_index(), 1);
}

#[tokio::test]
async fn streams_are_pulled_one_item_at_a_time() {
    let items = futures::stream::iter(study(&["x", "y"]));
    let mut log = Log::default();
    let outcome = run_campaign_stream(items, &mut log, 1, None).await.unwrap();
    assert_eq!(outcome.next_index(), 3);

    let mut session = CampaignSession::new(outcome.next_index());
    let more = futures::stream::iter(study(&["z"]));
    session
        .run_phase_stream("follow-up", more, &mut log)
        .await
        .unwrap();
    assert_eq!(session.next_index(), 4);
    assert_eq!(log.events.last().map(String::as_str), Some("post"));
    assert_eq!(log.events[4], "run 3 z");
}

#[tokio::test]
async fn resource_file_drives_exhaustion() {
    let dir = tempfile::tempdir().unwrap();
    let resources = ResourceConfig::new(dir.path().join("resources.json"));
    assert!(resources.set_value(SYSTEM_FLUID_KEY, json!(0.0)));

    let mut log = Log::default();
    let outcome = run_campaign(study(&["a"]), &mut log, 0, Some(&resources))
        .await
        .unwrap();
    assert!(outcome.is_exhausted());
    assert!(log.events.is_empty());
}

/// Finishes `limit` items, then hangs in the next one.
struct Stalls {
    limit: usize,
    done: Vec<u64>,
}

#[async_trait]
impl CampaignActions<u64> for Stalls {
    async fn run_item(&mut self, _item: u64, index: u64) -> anyhow::Result<()> {
        if self.done.len() == self.limit {
            std::future::pending::<()>().await;
        }
        self.done.push(index);
        Ok(())
    }

    async fn post(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn interrupted_phase_reports_the_first_unfinished_item() {
    let mut session = CampaignSession::new(5);
    let mut actions = Stalls {
        limit: 3,
        done: Vec::new(),
    };
    let interrupted = tokio::time::timeout(
        std::time::Duration::from_millis(50),
        session.run_phase("study", 0u64..10, &mut actions),
    )
    .await
    .is_err();
    assert!(interrupted);
    assert_eq!(actions.done, vec![5, 6, 7]);
    assert_eq!(session.next_index(), 8);

    actions.limit = 5;
    let outcome = session
        .run_phase("resumed", 0u64..2, &mut actions)
        .await
        .unwrap();
    assert_eq!(outcome, CampaignOutcome::Completed { next_index: 10 });
    assert_eq!(actions.done, vec![5, 6, 7, 8, 9]);
}
