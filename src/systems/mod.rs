pub mod edits;

pub use edits::{EditQueue, Ticket};
