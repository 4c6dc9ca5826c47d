mod compile;
mod plan;

pub use compile::{CompileArgs, cmd_compile};
pub use plan::{PlanArgs, cmd_plan};
