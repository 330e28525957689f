//! Configuration validation.

use super::{Config, ConnectionProperties};
use crate::error::{BulkLoadError, ConnectFailure, ConnectFailureKind, Result};

/// Smallest and largest TDS packet sizes the server negotiates.
const MIN_PACKET_SIZE: u32 = 512;
const MAX_PACKET_SIZE: u32 = 32767;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_connection(&config.connection)
}

/// Validate connection properties before any network activity.
///
/// Mutually exclusive options are reported as a connectivity failure so a
/// connect call fails the same way whether or not a config file was used.
pub fn validate_connection(props: &ConnectionProperties) -> Result<()> {
    if props.multi_subnet_failover && props.failover_partner.is_some() {
        return Err(ConnectFailure::new(
            ConnectFailureKind::IncompatibleOptions,
            "Connecting with the multiSubnetFailover connection property to a SQL Server \
             instance configured with the failoverPartner connection property is not supported.",
        )
        .into());
    }

    if props.host.trim().is_empty() {
        return Err(BulkLoadError::Config("connection.host is required".into()));
    }
    if props.instance_name.is_none() && props.port == 0 {
        return Err(BulkLoadError::Config(
            "connection.port must be between 1 and 65535".into(),
        ));
    }
    if let Some(instance) = &props.instance_name {
        if instance.trim().is_empty() {
            return Err(BulkLoadError::Config(
                "connection.instance_name cannot be empty when set".into(),
            ));
        }
    }
    if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&props.packet_size) {
        return Err(BulkLoadError::Config(format!(
            "connection.packet_size must be between {} and {}, got {}",
            MIN_PACKET_SIZE, MAX_PACKET_SIZE, props.packet_size
        )));
    }
    if !props.password.is_empty() && props.user.is_empty() {
        return Err(BulkLoadError::Config(
            "connection.password is set but connection.user is empty".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transfer::BulkCopyOptions;

    fn valid_config() -> Config {
        Config {
            connection: ConnectionProperties::new("localhost")
                .with_database("staging")
                .with_login("loader", "secret"),
            bulk_copy: BulkCopyOptions::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_host() {
        let mut config = valid_config();
        config.connection.host = "  ".to_string();
        assert!(matches!(validate(&config), Err(BulkLoadError::Config(_))));
    }

    #[test]
    fn test_zero_port() {
        let mut config = valid_config();
        config.connection.port = 0;
        assert!(validate(&config).is_err());

        config.connection.instance_name = Some("SQLEXPRESS".into());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_packet_size_bounds() {
        let mut config = valid_config();
        config.connection.packet_size = 511;
        assert!(validate(&config).is_err());
        config.connection.packet_size = 32767;
        assert!(validate(&config).is_ok());
        config.connection.packet_size = 32768;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_password_without_user() {
        let mut config = valid_config();
        config.connection.user = String::new();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_multi_subnet_with_failover_partner() {
        let mut config = valid_config();
        config.connection.multi_subnet_failover = true;
        config.connection.failover_partner = Some("mirror".into());

        let err = validate(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert!(err.to_string().contains("multiSubnetFailover"));
        assert!(!err.to_string().contains("ClientConnectionId"));
    }

    #[test]
    fn test_from_yaml_rejects_invalid() {
        let yaml = "connection:\n  host: ''\n";
        assert!(Config::from_yaml(yaml).is_err());
    }
}
