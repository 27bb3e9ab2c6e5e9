//! OData V4 cache and request coordination
//!
//! A [`CacheCoordinator`] sits between data bindings and a [`Transport`]. It
//! keeps one cache per resource that needs its own request, answers reads
//! from cached data where possible, merges concurrent edits into one PATCH per
//! entity, orders writes into change-sets of a `$batch`, tracks rows created
//! on the client until the server assigns their key, and keeps the message
//! model in step with every response.
//!
//! [`Transport`]: odata_trait::Transport

pub mod binding;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod create;
pub mod delete;
pub mod error;
pub mod group_lock;
pub mod messages;
pub mod node;
pub mod operation;
pub mod patch;
pub mod query;
pub mod read;
pub mod requestor;
pub mod retry;
pub mod side_effects;
pub mod tree;

pub use binding::{Binding, BindingKind, BindingParameters};
pub use config::{CacheConfig, SubmitMode};
pub use coordinator::{CacheCoordinator, Properties};
pub use create::{CreateOptions, CreatedContext, CreatedFuture};
pub use group_lock::{GroupLock, GroupLockManager};
pub use node::CacheNodeKind;
pub use operation::OperationKind;
pub use query::QueryOptions;
pub use read::RowSnapshot;

pub use odata_trait;
