mod engine;
mod store;

pub use engine::IdentityEngine;
pub use store::{NewUser, PgUserStore, UserPatch, UserRecord, UserStore};

#[cfg(test)]
pub use store::test_support;
