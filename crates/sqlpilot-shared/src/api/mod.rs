mod auth;
mod tables;
mod users;

pub use auth::*;
pub use tables::*;
pub use users::*;
