//! Campaign scheduling for liquid-handler experiments.
//!
//! See [`campaign`] for the scheduler and its state machine.

pub mod campaign;

pub use campaign::{
    run_campaign, run_campaign_stream, CampaignActions, CampaignError, CampaignOutcome,
    CampaignSession, CampaignState, NameTagged,
};
