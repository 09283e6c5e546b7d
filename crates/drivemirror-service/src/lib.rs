//! Core services of drivemirror.
//!
//! This crate contains everything that talks to the upstream drive: the coalescing
//! [`caching::MemoCache`], the [`credentials::CredentialPool`] and
//! [`tokens::TokenProvider`], the resilient [`streaming`] pipeline and the
//! [`listing::Catalog`] used for listings and searches.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod credentials;
pub mod error;
pub mod listing;
pub mod logging;
pub mod services;
pub mod streaming;
pub mod tokens;
pub mod tracker;
pub mod types;
pub mod upstream;
pub mod utils;

#[cfg(test)]
mod testutils;
