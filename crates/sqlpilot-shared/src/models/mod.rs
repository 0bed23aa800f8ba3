mod table;
mod user;

pub use table::*;
pub use user::*;
