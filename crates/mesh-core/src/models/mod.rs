pub mod agent;
pub mod run;
pub mod workflow;

pub use agent::*;
pub use run::*;
pub use workflow::*;
