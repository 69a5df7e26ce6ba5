pub mod loader;
pub mod types;

pub use loader::{default_config_toml, get_config_path, get_data_dir, load_config};
pub use types::{
    AuthConfig, AuthMode, BroadcastConfig, CommandRule, PolicyConfig, RetentionConfig,
    RunletConfig, RunnerConfig, StaticToken, WorkspaceConfig,
};
