pub mod agent;
pub mod utils;
