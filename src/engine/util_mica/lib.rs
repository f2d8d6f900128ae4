mod guid;
pub use guid::*;

pub mod hashing;

mod utils;
pub use utils::*;
