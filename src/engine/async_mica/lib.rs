mod task_pool;
pub use task_pool::*;
