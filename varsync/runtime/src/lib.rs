pub mod batcher;
pub mod change;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod path;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod store;
pub mod variable;
pub mod watch;
pub mod wrapper;

pub use crate::batcher::{BatchSink, OutgoingBatcher};
pub use crate::config::SyncConfig;
pub use crate::error::{CodecError, PathError, SyncError};
pub use crate::protocol::{Batch, Message, Priority, Properties, decode_batch, encode_batch};
pub use crate::runtime::{AppRuntime, JsonRuntime};
pub use crate::session::Session;
pub use crate::variable::{ObjectRef, ObserverId, ROOT_ID, VarId};
pub use crate::wrapper::WrapperRegistry;
pub use serde_json;
