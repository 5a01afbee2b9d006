#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod element;
pub mod record;
pub mod selection;
pub mod window;

pub use element::{Dataset, DatasetError, DatasetKind, Element, ElementError, NO_HOST};
pub use record::ElementRecord;
pub use selection::Selection;
pub use window::apply_window;
