pub mod relay;
pub mod supervisor;
mod worker;
