pub mod definitions;
pub mod registry;
pub mod sink;
pub mod types;
