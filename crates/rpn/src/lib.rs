//! The region proposal stage of a two-stage object detector.
//!
//! A [`proposal::ProposalNetwork`] slides a learned [`head::ProposalHead`] over a backbone feature
//! map, scores and refines one anchor per template and grid cell, and reduces them to a short list
//! of ranked, non-overlapping proposals. During training it also labels the anchors against the
//! ground truth, samples a balanced batch and computes the objectness and box regression losses.
//!
//! Parameter updates are left to the caller, through [`proposal::ProposalNetwork::head_mut`].

pub mod config;
mod error;
pub mod head;
pub mod loss;
pub mod proposal;
pub mod target;
pub mod util;

pub use error::{Error, Result};

#[allow(missing_docs)]
pub mod prelude {
    pub use crate::config::{Mode, ModeValue, RpnConfig};
    pub use crate::head::{ConvHead, HeadOutput, ProposalHead};
    pub use crate::loss::RpnLosses;
    pub use crate::proposal::{ProposalNetwork, ProposalOutput, TrainingBatch};
    pub use crate::target::{Assignment, Label, Sample, TargetAssigner};
    pub use crate::{Error, Result};
}
