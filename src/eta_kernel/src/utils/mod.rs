//! Utility
pub(crate) mod arena;

pub(crate) use self::arena::{define_key, Arena, Key};
