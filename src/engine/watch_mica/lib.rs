mod hot_reload;
pub use hot_reload::*;
