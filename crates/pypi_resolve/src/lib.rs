//! An incremental, delay-tolerant dependency resolver for the Python packaging
//! ecosystem: given root requirements and a target interpreter range it produces a
//! locked set of `{package, version}` pairs covering every transitive requirement,
//! together with the edge information needed to project that set onto a concrete
//! runtime environment.
//!
//! The engine interleaves three information sources of very different cost: release
//! listings and per-version metadata from the index (fast), METADATA read out of
//! wheel archives through range requests (slower, but authoritative where the index
//! lies), and sdist metadata builds (slow). I/O is coalesced into batched parallel
//! rounds that run whenever the single-threaded resolution loop runs out of work.

#![deny(missing_docs)]

pub mod index;
pub mod resolve;
pub mod sdist;
pub mod types;

mod reqparse;
mod utils;

pub use reqparse::parse_requirement_fixup;
pub use resolve::{
    resolve_requirement, resolve_requirements, ReleaseData, Resolution, ResolveError,
    ResolveOptions,
};
pub use utils::normalize_index_url;

pub use pep440_rs::{Version, VersionSpecifier, VersionSpecifiers};
pub use pep508_rs::{MarkerEnvironment, Requirement};
