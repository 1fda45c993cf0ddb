pub mod builder;
pub mod container;
pub mod module;
mod util;

pub mod prelude {
    pub use crate::builder::{Builder, Extender, TypedBuilder, TypedExtender};
    pub use crate::container::{Container, ContainerError, EntryStatus, Managed};
    pub use crate::module::{Configuration, Module};
}
