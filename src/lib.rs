pub mod dsl;
pub mod error;

pub use dsl::engine::{Program, ScriptEngine};
pub use dsl::error::{Diagnostic, RuntimeError};
pub use dsl::host::{HostObject, HostTypeId, NumKind, TypeBuilder, TypeDescriptor, TypeRef};
pub use dsl::options::{BufferSink, CompileOptions, PrintSink, StdoutSink};
pub use dsl::types::{MemberNaming, TypeError};
pub use dsl::value::Value;
pub use error::ScriptError;
