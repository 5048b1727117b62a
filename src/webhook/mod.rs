//! Webhook intake: domain entities, signature verification, and the
//! authenticated front door that turns deliveries into queued jobs.

pub mod event;
pub mod intake;
pub mod signature;

pub use event::{JobStatus, WebhookEvent, WebhookJob, WebhookSource, branch_name, worktree_name};
pub use intake::{IntakeOutcome, WebhookIntake};
pub use signature::{GitHubSignatureVerifier, SignatureVerifier, TrelloSignatureVerifier};
