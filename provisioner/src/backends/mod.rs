mod engine;
#[cfg(test)]
pub mod memory;

pub use engine::EngineBackend;
