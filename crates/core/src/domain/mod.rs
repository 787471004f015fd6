pub mod error;
pub mod indicator;
pub mod preset;
pub mod recommendation;
pub mod regime;
pub mod signal;
