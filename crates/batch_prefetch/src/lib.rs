pub mod loader;
pub mod prefetch;
pub mod slot;

pub use loader::BatchLoader;
pub use prefetch::{PrefetchConfig, PrefetchPipeline};
pub use slot::{ArraySpec, BatchSlot};
