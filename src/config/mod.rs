//! Configuration loading and the asset registry

mod settings;

pub use settings::{
    AssetRegistry, AssetSpec, BackfillSettings, DatabaseSettings, RetentionSettings,
    SchedulerSettings, Settings, StreamSettings, UpstreamSettings,
};
