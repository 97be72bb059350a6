//! support-qa - LLM quality assessment for support chats
//!
//! Scores customer-support transcripts with a language model and measures
//! how well those scores match known ground truth.
//!
//! # Pipeline
//!
//! ```text
//! generate ──► dataset.json
//!                  │
//! analyze  ──► analysis.json            3 rounds per dialog, majority vote
//!                  │
//! verify   ──► analysis_verified.json   second model, 6-item checklist
//!                  │
//! evaluate ──► evaluation*.json         accuracy, MAE, per-mistake F1
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use support_qa::{aggregate, apply_patches, patches_from};
//!
//! // Three rounds in, one consensus out
//! let consensus = aggregate(&[round1, round2, round3]);
//!
//! // Checklist answer in, patched judgment plus audit trail out
//! let (verified, changes) = apply_patches(&consensus, &patches_from(&checks));
//! ```
//!
//! Model calls go through the [`llm::ChatModel`] trait, so every stage can
//! be driven by an in-memory model in tests.

pub mod aggregate;
pub mod classify;
pub mod config;
pub mod error;
pub mod eval;
pub mod generate;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod prompts;
pub mod records;
pub mod retry;
pub mod types;
pub mod verify;

// Core types
pub use error::{PipelineError, Result};
pub use types::*;

// Aggregation and verification
pub use aggregate::{aggregate, try_aggregate};
pub use verify::{apply_patches, patches_from, verify, ChecklistItem, VerificationStatus, VerifiedJudgment};

// Model access
pub use config::{ModelConfig, PipelineConfig, RetryConfig};
pub use llm::{ChatModel, HttpChatModel};
pub use retry::RetryPolicy;

// Stages
pub use pipeline::{analyze_stage, evaluate_stage, generate_stage, verify_stage, Shutdown, StageSummary};
