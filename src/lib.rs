//! # ocrflow
//!
//! Batch pipeline for scanned document collections: mirror a Google Drive
//! folder, extract text with OCR, then send the text in overlapping chunks
//! to a Gemini model and fold the responses into per-file and combined term
//! reports. A small HTTP server runs the same commands as supervised jobs.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌──────────────────────────────┐
//! │  Drive    │──▶│   OCR     │──▶│ Analysis                     │
//! │  fetch    │   │ img/pdf/  │   │ chunk → model → parse →      │
//! │           │   │ pptx      │   │ aggregate → reports          │
//! └───────────┘   └───────────┘   └──────────────────────────────┘
//!        ▲              ▲                      ▲
//!        └──────────────┴──────────┬───────────┘
//!                            ┌─────┴─────┐
//!                            │  Jobs /   │
//!                            │  HTTP     │
//!                            └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`walker`] | Input file discovery |
//! | [`chunk`] | Overlapping text chunking |
//! | [`parse`] | Lenient JSON recovery from model responses |
//! | [`aggregate`] | Per-file and cross-file term aggregation |
//! | [`credentials`] | Service-account credentials |
//! | [`model_client`] | Vertex AI Gemini client |
//! | [`analyze`] | The `analyze` command |
//! | [`extract`] | Presentation slide text |
//! | [`ocr`] | The `ocr` command |
//! | [`drive`] | The `fetch` command |
//! | [`jobs`] | Supervised child processes |
//! | [`commands`] | Job payloads and command lines |
//! | [`server`] | Job control HTTP server |

pub mod aggregate;
pub mod analyze;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod drive;
pub mod extract;
pub mod jobs;
pub mod model_client;
pub mod models;
pub mod ocr;
pub mod parse;
pub mod server;
pub mod walker;
