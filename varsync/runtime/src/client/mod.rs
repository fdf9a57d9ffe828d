pub mod binding;
pub mod store;

pub use binding::{Access, Binding, BindingEngine, BindingKind, ElementId, HostElement};
pub use store::{FrontendStore, Inbound, Outbox, Transport};
