//! tallyset-sources: Remote submission back-ends.
//!
//! A paged JotForm client driven by the core adaptive fetcher, a Qualtrics
//! export client, the feed that combines them, and the `tallyset.toml`
//! configuration that wires it all together.

pub mod config;
pub mod error;
pub mod feed;
pub mod jotform;
pub mod mock;
pub mod qualtrics;

pub use config::{
    create_feed, create_jotform_client, load_config, load_config_from, SourceConfig,
    TallysetConfig,
};
pub use feed::DualSourceFeed;
pub use jotform::{JotformClient, QuestionMap};
pub use mock::MockPageSource;
pub use qualtrics::{ExportPolicy, QualtricsClient};
