mod aggregate;
mod cluster;
mod pipeline;
mod report;
mod run;

pub(crate) use run::{RunStatus, run};
