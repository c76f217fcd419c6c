use crate::{Result, ReservationError, ServiceConfig};
use config::{Config, ConfigError, Environment};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

fn read_properties<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>> {
    let file = File::open(&path).map_err(|e| {
        ReservationError::InvalidArgument(format!("Failed to open config file {:?}: {}", path.as_ref(), e))
    })?;

    let reader = BufReader::new(file);
    java_properties::read(reader)
        .map_err(|e| ReservationError::InvalidArgument(format!("Failed to parse properties: {}", e)))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ReservationError::InvalidArgument(format!("Invalid value for {}: {}", key, value))
    })
}

fn apply_property(config: &mut ServiceConfig, key: String, value: String) -> Result<()> {
    match key.as_str() {
        "bootstrap.servers" => config.kafka.bootstrap_servers = value,
        "security.protocol" => config.kafka.security_protocol = Some(value),
        "sasl.mechanism" => config.kafka.sasl_mechanism = Some(value),
        "sasl.username" => config.kafka.sasl_username = Some(value),
        "sasl.password" => config.kafka.sasl_password = Some(value),
        "ssl.ca.location" => config.kafka.ssl_ca_location = Some(value),
        "reservation.consumer.group" => config.consumer_group = value,
        "reservation.poll.timeout.ms" => config.poll_timeout_ms = parse_number(&key, &value)?,
        "reservation.poll.error.backoff.ms" => {
            config.poll_error_backoff_ms = parse_number(&key, &value)?
        }
        "reservation.channel.capacity" => config.channel_capacity = parse_number(&key, &value)?,
        "reservation.publish.workers" => config.publish_workers = parse_number(&key, &value)?,
        "reservation.publish.timeout.ms" => config.publish_timeout_ms = parse_number(&key, &value)?,
        "reservation.handler.timeout.ms" => {
            // 0 disables the per-handler timeout
            let millis: u64 = parse_number(&key, &value)?;
            config.handler_timeout_ms = (millis > 0).then_some(millis);
        }
        "reservation.allocation.attempts" => {
            config.allocation_attempts = parse_number(&key, &value)?
        }
        "reservation.shutdown.timeout.ms" => {
            config.shutdown_timeout_ms = parse_number(&key, &value)?
        }
        "reservation.shutdown.grace.ms" => config.shutdown_grace_ms = parse_number(&key, &value)?,
        "reservation.storage" => config.storage = value.parse()?,
        "reservation.state.dir" => config.state_dir = value,
        _ => {
            config.kafka.additional_properties.insert(key, value);
        }
    }
    Ok(())
}

/// Parse Java properties file into ServiceConfig
pub fn parse_properties_file<P: AsRef<Path>>(path: P, application_id: &str) -> Result<ServiceConfig> {
    let properties = read_properties(path)?;

    let mut config = ServiceConfig {
        application_id: application_id.to_string(),
        ..Default::default()
    };

    for (key, value) in properties {
        apply_property(&mut config, key, value)?;
    }

    Ok(config)
}

/// Merge a second properties file on top of an existing config. Keys it sets
/// win over the base file.
pub fn merge_properties_file<P: AsRef<Path>>(mut config: ServiceConfig, path: P) -> Result<ServiceConfig> {
    for (key, value) in read_properties(path)? {
        apply_property(&mut config, key, value)?;
    }
    Ok(config)
}

fn lookup<T: DeserializeOwned>(settings: &Config, key: &str) -> Result<Option<T>> {
    match settings.get::<T>(key) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(config: ServiceConfig) -> Result<ServiceConfig> {
    apply_env_source(config, Environment::default().try_parsing(true))
}

/// Apply overrides from an environment source: `KAFKA_SERVER` and the
/// `RESERVATION_*` variables.
pub fn apply_env_source(mut config: ServiceConfig, source: Environment) -> Result<ServiceConfig> {
    let settings = Config::builder().add_source(source).build()?;

    if let Some(servers) = lookup::<String>(&settings, "kafka_server")? {
        config.kafka.bootstrap_servers = servers;
    }
    if let Some(group) = lookup::<String>(&settings, "reservation_consumer_group")? {
        config.consumer_group = group;
    }
    if let Some(millis) = lookup::<u64>(&settings, "reservation_poll_timeout_ms")? {
        config.poll_timeout_ms = millis;
    }
    if let Some(workers) = lookup::<usize>(&settings, "reservation_publish_workers")? {
        config.publish_workers = workers;
    }
    if let Some(millis) = lookup::<u64>(&settings, "reservation_handler_timeout_ms")? {
        config.handler_timeout_ms = (millis > 0).then_some(millis);
    }
    if let Some(attempts) = lookup::<u32>(&settings, "reservation_allocation_attempts")? {
        config.allocation_attempts = attempts;
    }
    if let Some(storage) = lookup::<String>(&settings, "reservation_storage")? {
        config.storage = storage.parse()?;
    }
    if let Some(dir) = lookup::<String>(&settings, "reservation_state_dir")? {
        config.state_dir = dir;
    }

    Ok(config)
}
