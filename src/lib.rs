//! # lockwatch
//!
//! Lock-state detection for chat-driven site checks.
//!
//! A photo of one or more padlocks goes in; a verdict per lock and a safety
//! summary for the whole image come out. Images arrive either as direct
//! uploads over HTTP or as attachments of DingTalk group messages that
//! mention the bot. Every distinct image is classified once and stored by its
//! content fingerprint, and a formatted result is posted back to the chat.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌────────────┐   ┌──────────┐
//! │  Webhook   │──▶│ Orchestrator │──▶│ Classifier │──▶│  SQLite  │
//! │  / Upload  │   │ (states)     │   │ det+feature│   │  dedup   │
//! └────────────┘   └──────┬───────┘   └────────────┘   └──────────┘
//!                         │
//!                         ▼
//!                  ┌──────────────┐
//!                  │ Chat reply   │
//!                  │ (markdown)   │
//!                  └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! lockwatch init                       # create database
//! lockwatch detect ./photo.jpg         # classify one image
//! lockwatch stats                      # summary of stored detections
//! lockwatch serve                      # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Pipeline error taxonomy |
//! | [`detector`] | Object detector abstraction |
//! | [`analyzer`] | Bounding-box feature fallback |
//! | [`classifier`] | Lock-state classification |
//! | [`store`] | Fingerprint-keyed detection store |
//! | [`intake`] | Lookup-before-classify admission |
//! | [`signature`] | Callback signature verification |
//! | [`message`] | Webhook payload parsing |
//! | [`mention`] | Bot mention gating |
//! | [`retriever`] | Image download |
//! | [`formatter`] | Chat message rendering |
//! | [`render`] | Annotated preview images |
//! | [`dispatch`] | Outbound chat delivery |
//! | [`orchestrator`] | Callback state machine |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod analyzer;
pub mod classifier;
pub mod config;
pub mod db;
pub mod detect_cmd;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod formatter;
pub mod intake;
pub mod mention;
pub mod message;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod render;
pub mod retriever;
pub mod server;
pub mod signature;
pub mod stats;
pub mod store;
