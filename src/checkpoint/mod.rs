pub mod loader;
pub mod writer;

pub use loader::{LoadedCheckpoint, load_checkpoint};
pub use writer::{CHECKPOINT_FILE_NAME, CheckpointMeta, write_checkpoint};
