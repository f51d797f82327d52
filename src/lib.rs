pub mod core;
pub mod gen;
pub mod grammar;
pub mod providers;
pub mod registry;
pub mod schema;
pub mod thread;

pub use crate::core::error::{AugurError, TransportError};
pub use crate::gen::{GenConf, GenError, GenOut, GenRes, OutFormat};
pub use crate::providers::{create, AnthropicModel, LlamaCppModel, Model, OpenAiCompatModel};
pub use crate::registry::Registry;
pub use crate::schema::{FieldSpec, RecordSpec, SchemaConf, Target, TargetValue};
pub use crate::thread::{Msg, MsgKind, Thread};
