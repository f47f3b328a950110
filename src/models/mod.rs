pub mod features;
pub mod inventory;
pub mod topology;

pub use features::*;
pub use inventory::*;
pub use topology::*;
