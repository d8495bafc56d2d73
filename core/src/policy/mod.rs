pub mod plan;
pub mod python;
pub mod sql;

pub use plan::compile_plan;
pub use python::check_python;
pub use sql::normalize_and_check_sql;
