//! External Enricher Contracts (C7): URL shortener, GitHub context lookup,
//! and sippy PR-diff lookup. Each enricher owns its own HTTP client and
//! swallows its own failures rather than failing the analysis — per
//! spec.md §4.7/§7, degradation is always to an empty/"unknown" result.

pub mod github;
pub mod shortener;
pub mod sippy;
