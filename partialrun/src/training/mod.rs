mod agent;
mod feeds_fetches;

pub use agent::{create_and_initialize_feeds_fetches_manager, run_core, TrainingAgent};
pub use feeds_fetches::FeedsFetchesManager;
