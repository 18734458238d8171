mod core;
mod html;
mod matcher;
mod ops;
mod plugin;
mod serde_value;

pub use crate::core::*;
pub use crate::html::*;
pub use crate::matcher::*;
pub use crate::ops::*;
pub use crate::plugin::*;
pub use crate::serde_value::*;
