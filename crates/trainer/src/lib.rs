//! Trainer - the training-loop driver
//!
//! The model, optimizer and data loader are collaborators behind narrow
//! traits. [`TrainingLoop`] wires them to the work scheduler, the EMA
//! tracker, the performance instrumentor and the checkpoint manager, and
//! delegates gradient post-processing to a swappable [`TrainingBackend`].

pub mod backend;
pub mod collaborators;
pub mod driver;
pub mod optimizer;

pub use backend::{DataParallelBackend, GradientReport, LocalBackend, TrainingBackend};
pub use collaborators::{DataLoader, Model, Optimizer};
pub use driver::{Collaborators, FitSummary, Resume, TrainingLoop};
pub use optimizer::SgdMomentum;
