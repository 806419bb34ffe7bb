//! Core types shared by the introspector, diff engine and data engine.
//!
//! - [`identifier`]: identifier validation and quoting
//! - [`schema`]: catalog snapshot types
//! - [`traits`]: database seams used by the engines
//! - [`value`]: row values and their SQL literal form

pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{
    Column, ColumnReference, CompositeConstraint, ConstraintKind, EnumType, ForeignKey, Index,
    ReferentialAction, SchemaSnapshot, Sequence, Table,
};
pub use traits::{pg_error_message, StatementFailure, StatementRunner, TableLoader};
pub use value::SqlValue;
