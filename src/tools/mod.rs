pub mod dispatch;
pub mod echo;
pub mod executor;
pub mod registry;

pub use dispatch::{NoopDispatch, ToolDispatch, ToolEnvelope, ToolStatus};
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry};
