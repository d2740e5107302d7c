pub mod manager;

pub use manager::TargetManager;
