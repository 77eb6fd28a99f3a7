//! Shared entity, id, and push-event types for Kaisha.
//!
//! This crate is the data contract: typed IDs, the `Company` record, name
//! validation, and the events the server pushes. It has **no internal kaisha
//! dependencies**, a pure leaf crate that the cache and client build on.
//!
//! # Key Types
//!
//! |-------------------|----------------------------------------------|
//! | Type              | Purpose                                      |
//! |-------------------|----------------------------------------------|
//! | [`Company`]       | The entity (id + mutable name)               |
//! | [`CompanyId`]     | Server id, or negative placeholder for adds  |
//! | [`OperationId`]   | Handle for one local mutation                |
//! | [`MutationKind`]  | add / rename / delete                        |
//! | [`PushEvent`]     | Server-initiated change notification         |
//! |-------------------|----------------------------------------------|

pub mod company;
pub mod event;
pub mod ids;

pub use company::{Company, MAX_NAME_LEN, ValidationError, validate_id, validate_name};
pub use event::{MutationKind, PushEvent};
pub use ids::{CompanyId, OperationId};
