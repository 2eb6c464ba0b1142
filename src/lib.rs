//! # blocksync - authoritative IP blacklist with firewall reconciliation
//!
//! One authority keeps a blacklist and a whitelist of addresses and ranges.
//! Enforcement agents periodically pull the effective blacklist (blacklist
//! minus whitelist) and converge a live packet filter table to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Authority (blocksync serve)                                │
//! │    feeds ──► scheduler ──► normalizer ──► store (rusqlite)  │
//! │    api (axum): import, export, health                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Agent (blocksync agent / sync)                             │
//! │    authority client (reqwest) ──► reconciler                │
//! │      └── BlockTable: ipfw | nftables                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Precedence** - a whitelisted address never appears in any blacklist export
//! - **Insert-or-ignore** - re-adding an address is a reported no-op
//! - **Safe ordering** - baseline rules first, then removals, then additions
//! - **No self-lockout** - entries covering the authority are never blocked
//! - **Fetch-failure safety** - an unreachable authority leaves the filter untouched
//!
//! ## Modules
//!
//! - [`api`] - HTTP routes of the authority
//! - [`authority`] - Agent-side client for the authority
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - Mockable process execution
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`enforcer`] - Block table backends (ipfw, nftables, in-memory)
//! - [`exporter`] - JSON, CSV and firewall directive renderings
//! - [`feeds`] - External reputation feed importers
//! - [`lock`] - One agent per enforcement point
//! - [`normalizer`] - Token validation and CIDR expansion
//! - [`reconciler`] - Fetch, diff and apply cycle
//! - [`scheduler`] - Periodic feed imports
//! - [`service`] - Single and bulk import interface
//! - [`signal`] - Graceful shutdown
//! - [`store`] - SQLite list store

pub mod api;
pub mod authority;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod enforcer;
pub mod error;
pub mod exporter;
pub mod feeds;
pub mod lock;
pub mod model;
pub mod normalizer;
pub mod reconciler;
pub mod scheduler;
pub mod service;
pub mod signal;
pub mod store;

pub use config::Config;
pub use model::{ListEntry, ListKind};
pub use reconciler::{CycleOutcome, Reconciler};
