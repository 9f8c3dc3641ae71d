//! Operations Module
//!
//! Static mapping from operation names to external tool invocations.
//!
//! - `types`: operation descriptors, selectors and command plans
//! - `catalog`: the built-in operations and their planners
//! - `registry`: the immutable table handed to intake and the dispatcher

mod catalog;
mod registry;
mod types;

pub use catalog::{builtin_operations, parse_page_ranges};
pub use registry::OperationRegistry;
pub use types::{
    output_path, path_arg, CommandLine, ExpectedOutputs, InputKind, OperationInfo,
    OperationSelector, OperationSpec, Plan, PlanContext, Planner, DOCUMENT_EXTENSIONS, INPUT_DIR,
    OUTPUT_DIR,
};
