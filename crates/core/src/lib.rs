//! Tally core types: schema-less records, query specs, mutation specs and errors.
//!
//! Everything here is transport-agnostic. Remote backends, the query cache and the
//! bindings all speak in these types.

#![forbid(unsafe_code)]

mod error;
mod mutation;
mod query;
mod record;

pub use error::{DataError, DataResult};
pub use mutation::{MutationKind, MutationSpec};
pub use query::{OrderBy, QueryKey, QuerySpec, Selection};
pub use record::{
    compare_values, id_key, into_record, merge_into, next_id, record_id, values_equal, Record, ID_FIELD,
};

pub mod prelude {
    pub use super::{
        DataError, DataResult, MutationKind, MutationSpec, OrderBy, QueryKey, QuerySpec, Record,
        Selection, ID_FIELD,
    };
}
