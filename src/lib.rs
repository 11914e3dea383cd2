pub mod application;
pub mod indexes;
pub mod pipeline;
pub mod registry;
pub mod tree;
