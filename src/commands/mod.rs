pub mod analyze;
pub mod inputs;
pub mod scan;
pub mod trend;
