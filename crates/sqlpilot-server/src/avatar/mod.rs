mod generator;
mod store;

pub use generator::{generate, GeneratedAvatar, AVATAR_SIZE};
pub use store::{AvatarStore, CleanupOutcome, FsAvatarStore, AVATAR_PUBLIC_PREFIX};

#[cfg(test)]
pub use store::test_support;
