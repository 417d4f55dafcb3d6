pub mod analytics;
pub mod jobs;
pub mod patches;
pub mod sites;
