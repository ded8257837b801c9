//! 对话层：dax 编码、flow 目录、flow 栈、对话状态、歧义追踪、展示帧

pub mod ambiguity;
pub mod catalog;
pub mod dax;
pub mod display;
pub mod flow_stack;
pub mod state;

pub use ambiguity::{AmbiguityDeclaration, AmbiguityLevel, AmbiguityTracker};
pub use catalog::{FlowCatalog, FlowSpec, Intent, SlotSpec, ToolStep, DEFAULT_FLOW};
pub use dax::{DaxCode, DialogueAct};
pub use display::{DisplayFrame, Frame};
pub use flow_stack::{FlowEntry, FlowStack, FlowStatus};
pub use state::{DialogueState, Prediction};
