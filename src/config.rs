use crate::broker::config::BrokerConfig;

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HeddaConfig {
    pub broker: BrokerConfig,
}

/// Loads configuration from a file, overridden by `HEDDA_`-prefixed environment variables.
pub fn config<P: AsRef<std::path::Path>>(config_path: P) -> anyhow::Result<HeddaConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::from(config_path.as_ref()))
        .add_source(config::Environment::with_prefix("HEDDA").separator("__"))
        .build()?;
    let config: HeddaConfig = settings.try_deserialize()?;
    config.broker.validate()?;
    Ok(config)
}
