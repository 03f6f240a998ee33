//! Models: static definitions, the registry, and instances.

mod def;
mod instance;
mod registry;

pub use def::{IndexDef, LinkTable, ModelBuilder, ModelDef, PK_ALIAS};
pub use instance::{Instance, SaveOutcome};
pub use registry::{qualify_target, ModelRegistry, ReverseRelation};

pub(crate) use instance::apply_on_delete;
